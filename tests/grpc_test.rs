//! Tests for the gRPC interceptors.

mod common;

use std::convert::Infallible;
use std::sync::Arc;

use common::{tag, TestReporter};
use surveil::{CallFailure, InterceptorOptions, ReportOn, Reporter, RequestHub};
use tokio_stream::StreamExt;
use tonic::body::BoxBody;
use tonic::metadata::MetadataMap;
use tonic::service::Interceptor;
use tonic::{Code, Request, Response, Status};
use tower::{Service, ServiceBuilder, ServiceExt};

#[tokio::test]
async fn test_unary_success_passes_through() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.unary_interceptor();

    let response = interceptor
        .intercept(Request::new(20_u32), |request| async move {
            Ok(Response::new(request.into_inner() + 1))
        })
        .await
        .expect("call should succeed");

    assert_eq!(response.into_inner(), 21);
    assert!(fixture.events().is_empty());
}

#[tokio::test]
async fn test_unary_panic_becomes_internal_status() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.unary_interceptor();

    let status = interceptor
        .intercept(Request::new(()), |_request| async move {
            if true {
                panic!("ledger out of balance");
            }
            Ok(Response::new(()))
        })
        .await
        .expect_err("panic should become an error");

    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "ledger out of balance");

    let events = fixture.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].exception.values[0].ty, "panic");
    assert_eq!(events[0].level, sentry::Level::Fatal);
}

#[tokio::test]
async fn test_unary_outcome_keeps_panic_distinct() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.unary_interceptor();

    let failure = interceptor
        .intercept_outcome(Request::new(()), |_request| async move {
            if true {
                panic!("{}", String::from("index 9 out of range"));
            }
            Ok(Response::new(()))
        })
        .await
        .expect_err("panic should be a failure");

    match failure {
        CallFailure::Panicked(recovered) => {
            assert_eq!(recovered.message(), "index 9 out of range");
            assert!(!recovered.event_id().is_empty());
        }
        CallFailure::Status(status) => panic!("unexpected status: {status:?}"),
    }
}

#[tokio::test]
#[should_panic(expected = "ledger out of balance")]
async fn test_unary_repanic_when_configured() {
    let fixture = TestReporter::new();
    let interceptor = fixture
        .reporter
        .unary_interceptor_with(InterceptorOptions::default().with_repanic(true));

    let _ = interceptor
        .intercept(Request::new(()), |_request| async move {
            if true {
                panic!("ledger out of balance");
            }
            Ok::<_, Status>(Response::new(()))
        })
        .await;
}

#[tokio::test]
async fn test_unary_reports_server_faults_only() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.unary_interceptor();

    let status = interceptor
        .intercept(Request::new(()), |_request| async move {
            Err::<Response<()>, _>(Status::invalid_argument("topic cannot be empty"))
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(fixture.events().is_empty());

    let status = interceptor
        .intercept(Request::new(()), |_request| async move {
            Err::<Response<()>, _>(Status::internal("database error: disk full"))
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "database error: disk full");

    let events = fixture.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].exception.values[0].value.as_deref(),
        Some("database error: disk full")
    );
    assert_eq!(tag(&events[0], "grpc.code"), Some("Internal"));
}

#[tokio::test]
async fn test_reported_status_carries_no_metadata() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.unary_interceptor();

    let _ = interceptor
        .intercept(Request::new(()), |_request| async move {
            let mut metadata = MetadataMap::new();
            metadata.insert("x-session-token", "secret-abc".parse().unwrap());
            Err::<Response<()>, _>(Status::with_metadata(Code::Internal, "db down", metadata))
        })
        .await;

    let events = fixture.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].exception.values[0].value.as_deref(), Some("db down"));
    let payload = serde_json::to_string(&events[0]).unwrap();
    assert!(!payload.contains("secret-abc"), "metadata leaked: {payload}");
    assert!(!payload.contains("x-session-token"), "metadata leaked: {payload}");
}

#[tokio::test]
async fn test_report_on_always() {
    let fixture = TestReporter::new();
    let interceptor = fixture
        .reporter
        .unary_interceptor_with(InterceptorOptions::default().with_report_on(ReportOn::Always));

    let _ = interceptor
        .intercept(Request::new(()), |_request| async move {
            Err::<Response<()>, _>(Status::not_found("no such topic"))
        })
        .await;

    assert_eq!(fixture.events().len(), 1);
}

#[tokio::test]
async fn test_unary_attaches_session_when_missing() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.unary_interceptor();

    let response = interceptor
        .intercept(Request::new(()), |request| async move {
            let hub = RequestHub::from_grpc(&request);
            Ok(Response::new(hub.is_some()))
        })
        .await
        .unwrap();

    assert!(response.into_inner());
}

#[tokio::test]
async fn test_unary_reuses_session_from_interceptor() {
    let fixture = TestReporter::new();
    let mut sessions = fixture.reporter.session_interceptor();
    let interceptor = fixture.reporter.unary_interceptor();

    // What tonic's InterceptedService does before invoking the service.
    let (metadata, extensions, ()) = sessions.call(Request::new(())).unwrap().into_parts();
    let request = Request::from_parts(metadata, extensions, "payload");
    let attached = RequestHub::from_grpc(&request).expect("session attached");
    attached.configure_scope(|scope| scope.set_tag("peer", "10.0.0.7"));

    let expected = attached.clone();
    let status = interceptor
        .intercept(request, |request| async move {
            let hub = RequestHub::from_grpc(&request).unwrap();
            assert!(Arc::ptr_eq(&hub, &expected));
            Err::<Response<()>, _>(Status::unavailable("broker restarting"))
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);

    let events = fixture.events();
    assert_eq!(events.len(), 1);
    assert_eq!(tag(&events[0], "peer"), Some("10.0.0.7"));
}

#[tokio::test]
async fn test_stream_handler_sees_session_on_stream() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.stream_interceptor();
    let inbound = tokio_stream::iter(vec![1_u64, 2, 3, 4]);

    let response = interceptor
        .intercept(Request::new(inbound), |request| async move {
            let on_request = RequestHub::from_grpc(&request).expect("session on request");
            let mut stream = request.into_inner();
            assert!(Arc::ptr_eq(stream.hub(), &on_request));

            let mut total = 0;
            while let Some(value) = stream.next().await {
                total += value;
            }
            Ok(Response::new(total))
        })
        .await
        .unwrap();

    assert_eq!(response.into_inner(), 10);
    assert!(fixture.events().is_empty());
}

#[tokio::test]
async fn test_stream_panic_is_returned_as_internal() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.stream_interceptor();
    let inbound = tokio_stream::iter(vec!["ack", "nack"]);

    let status = interceptor
        .intercept(Request::new(inbound), |request| async move {
            let mut stream = request.into_inner();
            while let Some(frame) = stream.next().await {
                if frame == "nack" {
                    panic!("unexpected frame: {frame}");
                }
            }
            Ok(Response::new(()))
        })
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "unexpected frame: nack");
    assert_eq!(fixture.events().len(), 1);
}

#[tokio::test]
async fn test_stream_reports_handler_error() {
    let fixture = TestReporter::new();
    let interceptor = fixture.reporter.stream_interceptor();

    let status = interceptor
        .intercept(Request::new(tokio_stream::empty::<u8>()), |_request| async move {
            Err::<Response<()>, _>(Status::data_loss("cursor lost"))
        })
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::DataLoss);
    assert_eq!(fixture.events().len(), 1);
}

#[tokio::test]
async fn test_disabled_reporter_still_recovers_panics() {
    let reporter = Reporter::disabled();
    let interceptor = reporter.unary_interceptor();

    let status = interceptor
        .intercept(Request::new(()), |_request| async move {
            if true {
                panic!("no backend configured");
            }
            Ok(Response::new(()))
        })
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "no backend configured");
}

async fn routed(request: http::Request<()>) -> Result<http::Response<BoxBody>, Infallible> {
    // What tonic does before handing the call to the generated server.
    let request = Request::from_http(request);
    assert!(RequestHub::from_grpc(&request).is_some(), "session missing");
    if request.metadata().contains_key("x-explode") {
        panic!("handler exploded");
    }
    Ok(http::Response::new(tonic::body::empty_body()))
}

fn grpc_request(path: &str, explode: bool) -> http::Request<()> {
    let mut builder = http::Request::builder().uri(path);
    if explode {
        builder = builder.header("x-explode", "1");
    }
    builder.body(()).unwrap()
}

#[tokio::test]
async fn test_server_layer_recovers_every_method() {
    let fixture = TestReporter::new();
    let mut service = ServiceBuilder::new()
        .layer(fixture.reporter.grpc_layer())
        .service_fn(routed);

    let response = service
        .ready()
        .await
        .unwrap()
        .call(grpc_request("/ledger.Ledger/Post", false))
        .await
        .unwrap();
    assert!(Status::from_header_map(response.headers()).is_none());
    assert!(fixture.events().is_empty());

    for path in ["/ledger.Ledger/Post", "/ledger.Ledger/Reconcile"] {
        let response = service
            .ready()
            .await
            .unwrap()
            .call(grpc_request(path, true))
            .await
            .unwrap();
        let status = Status::from_header_map(response.headers()).expect("grpc-status header");
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "handler exploded");
    }

    let events = fixture.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].exception.values[0].ty, "panic");
}

#[tokio::test]
#[should_panic(expected = "handler exploded")]
async fn test_server_layer_repanics_when_configured() {
    let fixture = TestReporter::new();
    let service = ServiceBuilder::new()
        .layer(
            fixture
                .reporter
                .grpc_layer_with(InterceptorOptions::default().with_repanic(true)),
        )
        .service_fn(routed);

    let _ = service.oneshot(grpc_request("/ledger.Ledger/Post", true)).await;
}
