//! End-to-end verb tests: describe, variable read, function call and
//! signal raising against a scripted device.

mod support;

use std::time::Duration;

use corelink::coap::Code;
use corelink::messages::DeviceValue;
use support::{connect, connect_default, fast_config, hello_payload};

#[tokio::test]
async fn test_describe_single_response() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.describe().await });

    let describe = harness.device.read().await;
    assert_eq!(describe.uri_path, "d");
    assert_eq!(describe.code, Code::Get);
    assert_eq!(describe.token.len(), 1);

    harness
        .device
        .respond(
            &describe,
            br#"{"m":"photon","f":["reset"],"v":{"temp":2,"ok":1}}"#,
        )
        .await;

    let introspection = verb.await.unwrap().expect("describe");
    assert_eq!(introspection.system_information["m"], "photon");
    // Integer type tags are normalized
    assert_eq!(introspection.function_state["v"]["temp"], "int32");
    assert_eq!(introspection.function_state["v"]["ok"], "bool");
}

#[tokio::test]
async fn test_describe_two_phase() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.describe().await });

    let describe = harness.device.read().await;

    // First response: system information only
    harness
        .device
        .respond(&describe, br#"{"m":"photon","firmware":"1.5.2"}"#)
        .await;
    // Second response: the application state, same token
    harness
        .device
        .respond(&describe, br#"{"f":["reset"],"v":{"temp":2}}"#)
        .await;

    let introspection = verb.await.unwrap().expect("describe");
    assert_eq!(introspection.system_information["firmware"], "1.5.2");
    assert_eq!(introspection.function_state["f"][0], "reset");
    assert_eq!(introspection.function_state["v"]["temp"], "int32");
}

#[tokio::test]
async fn test_get_variable_decodes_declared_type() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.get_variable("temp").await });

    let describe = harness.device.read().await;
    harness
        .device
        .respond(&describe, br#"{"f":[],"v":{"temp":"int32"}}"#)
        .await;

    let request = harness.device.read().await;
    assert_eq!(request.uri_path, "v/temp");
    assert_eq!(request.code, Code::Get);
    assert_eq!(request.token.len(), 1);

    harness.device.respond(&request, &[0x00, 0x00, 0x00, 0x2A]).await;

    assert_eq!(verb.await.unwrap().expect("get_variable"), DeviceValue::Int(42));
}

#[tokio::test]
async fn test_unknown_variable_sends_nothing() {
    let mut harness = connect_default().await;

    // Prime introspection
    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.describe().await });
    let describe = harness.device.read().await;
    harness
        .device
        .respond(&describe, br#"{"f":[],"v":{"temp":"int32"}}"#)
        .await;
    verb.await.unwrap().expect("describe");

    let err = harness
        .session
        .get_variable("nope")
        .await
        .expect_err("unknown variable");
    assert_eq!(err.to_string(), "Variable not found");

    assert!(
        harness.device.try_read(Duration::from_millis(300)).await.is_none(),
        "no request frame may be emitted"
    );
}

#[tokio::test]
async fn test_call_function_encodes_args_and_decodes_int() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move {
        session
            .call_function("digitalwrite", &["D7".to_string(), "HIGH".to_string()])
            .await
    });

    let describe = harness.device.read().await;
    harness
        .device
        .respond(
            &describe,
            br#"{"f":["digitalwrite"],"v":{},"digitalwrite":{"returns":"int","args":[["pin","String"],["level","String"]]}}"#,
        )
        .await;

    let call = harness.device.read().await;
    assert_eq!(call.uri_path, "f/digitalwrite");
    assert_eq!(call.code, Code::Post);
    assert_eq!(call.uri_query.as_deref(), Some("D7,HIGH"));

    harness.device.respond(&call, &1i32.to_be_bytes()).await;

    assert_eq!(verb.await.unwrap().expect("call"), DeviceValue::Int(1));
}

#[tokio::test]
async fn test_call_function_old_form_single_string_arg() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move {
        session
            .call_function("DigitalRead", &["D7".to_string()])
            .await
    });

    let describe = harness.device.read().await;
    harness
        .device
        .respond(&describe, br#"{"f":["digitalread"],"v":{}}"#)
        .await;

    let call = harness.device.read().await;
    assert_eq!(call.uri_path, "f/DigitalRead");
    assert_eq!(call.uri_query.as_deref(), Some("D7"));

    harness.device.respond(&call, &0i32.to_be_bytes()).await;
    assert_eq!(verb.await.unwrap().expect("call"), DeviceValue::Int(0));
}

#[tokio::test]
async fn test_unknown_function_fails() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.call_function("missing", &[]).await });

    let describe = harness.device.read().await;
    harness
        .device
        .respond(&describe, br#"{"f":["reset"],"v":{}}"#)
        .await;

    let err = verb.await.unwrap().expect_err("unknown function");
    assert_eq!(err.to_string(), "Unknown Function");
}

#[tokio::test]
async fn test_raise_signal_toggles_uri() {
    let mut harness = connect_default().await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.raise_signal(true).await });

    let signal = harness.device.read().await;
    assert_eq!(signal.uri_path, "s/1");
    harness.device.respond(&signal, &[]).await;
    verb.await.unwrap().expect("signal on");

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.raise_signal(false).await });

    let signal = harness.device.read().await;
    assert_eq!(signal.uri_path, "s/0");
    harness.device.respond(&signal, &[]).await;
    verb.await.unwrap().expect("signal off");
}

#[tokio::test]
async fn test_silent_device_times_out_but_session_lives() {
    let mut harness = connect(fast_config(), 50, &hello_payload()).await;

    let session = harness.session.clone();
    let verb = tokio::spawn(async move { session.describe().await });

    // Read the Describe and never answer
    let _describe = harness.device.read().await;

    let err = verb.await.unwrap().expect_err("must time out");
    assert_eq!(err.to_string(), "Request timed out");

    // The session still serves: a ping round-trips
    let ping_id = harness.device.ping().await;
    let ack = harness.device.read().await;
    assert_eq!(ack.message_id, ping_id);
}
