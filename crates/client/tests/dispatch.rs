//! End-to-end dispatch through the client and a scripted transport.

use std::sync::Arc;
use std::time::Duration;

use micro_client::error::ClientError;
use micro_client::response::handlers;
use micro_client::transport::Transport;
use micro_client::{Client, Request, WorkerPool};

mod common;

use common::ScriptedTransport;

fn client(transport: &Arc<ScriptedTransport>) -> Client {
    common::init_tracing();
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    Client::builder().shared_transport(transport).worker_pool(WorkerPool::new(2).unwrap()).build().unwrap()
}

#[test]
fn plain_get_returns_status_and_body() {
    let transport = ScriptedTransport::new();
    transport.route("/x", 200, "ok");

    let request = Request::builder_with("https://api.example.com/x").get().build().unwrap();
    let response = client(&transport).send(&request, handlers::string()).unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), "ok");
    assert_eq!(transport.requests().len(), 1);
}

#[test]
fn overridden_authorization_reaches_the_transport_once() {
    let transport = ScriptedTransport::new();
    transport.route("/someEndPoint", 201, "created");

    let request = Request::builder_with("https://api.myapp.com/someEndPoint")
        .header("Authorization", "Bearer k1")
        .post()
        .body("the string version of my request body")
        .set_header("Authorization", "Bearer k2")
        .build()
        .unwrap();

    let response = client(&transport).send(&request, handlers::string()).unwrap();
    assert_eq!(response.status(), 201);

    let sent = transport.requests();
    assert_eq!(sent[0].headers().values("authorization"), vec!["Bearer k2"]);
    assert_eq!(sent[0].body().unwrap().to_bytes(), "the string version of my request body");
}

#[test]
fn combined_bodies_keep_argument_order() {
    for (first_delay, second_delay) in [(40, 0), (0, 40)] {
        let transport = ScriptedTransport::new();
        transport.route_delayed("/todos/1", 200, "body1", Duration::from_millis(first_delay));
        transport.route_delayed("/posts", 200, "body2", Duration::from_millis(second_delay));
        let client = client(&transport);

        let get = Request::builder_with("https://jsonplaceholder.typicode.com/todos/1").build().unwrap();
        let post = Request::builder_with("https://jsonplaceholder.typicode.com/posts")
            .post()
            .headers(&["Content-Type", "application/json", "Accept", "application/json"])
            .body(r#"{"title":"foo"}"#)
            .build()
            .unwrap();

        let left = client.send_async(&get, handlers::string()).then_apply(|response| response.into_body());
        let right = client.send_async(&post, handlers::string()).then_apply(|response| response.into_body());

        let combined = left.then_combine(&right, |a, b| format!("{a} : {b}")).wait().unwrap();
        assert_eq!(combined, "body1 : body2");
    }
}

#[test]
fn then_accept_sees_the_response_once() {
    let transport = ScriptedTransport::new();
    transport.route("/todos/1", 200, "todo");
    let client = client(&transport);

    let request = Request::builder_with("https://jsonplaceholder.typicode.com/todos/1").build().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();

    client
        .send_async(&request, handlers::string())
        .then_accept(move |response| tx.send(response.into_body()).unwrap())
        .wait()
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "todo");
    assert!(rx.try_recv().is_err());
}

#[test]
fn one_request_can_be_dispatched_many_times() {
    let transport = ScriptedTransport::new();
    transport.route("/x", 200, "ok");
    let client = client(&transport);

    let request = Request::builder_with("https://api.example.com/x").header("Accept", "text/plain").build().unwrap();
    let promises: Vec<_> = (0..8).map(|_| client.send_async(&request, handlers::string())).collect();

    for promise in promises {
        assert_eq!(promise.wait().unwrap().body(), "ok");
    }
    assert_eq!(transport.requests().len(), 8);
    assert!(transport.requests().iter().all(|sent| *sent == request));
}

#[test]
fn deadline_elapses_before_a_slow_response() {
    let transport = ScriptedTransport::new();
    transport.route_delayed("/slow", 200, "late", Duration::from_millis(500));

    let request = Request::builder_with("https://api.example.com/slow").timeout(Duration::from_millis(20)).build().unwrap();
    let err = client(&transport).send(&request, handlers::string()).unwrap_err();

    assert!(matches!(err, ClientError::Timeout));
    assert_eq!(transport.executed(), 0);
}

#[test]
fn cancelling_stops_the_exchange() {
    let transport = ScriptedTransport::new();
    transport.route_delayed("/slow", 200, "late", Duration::from_millis(200));
    let client = client(&transport);

    let request = Request::builder_with("https://api.example.com/slow").build().unwrap();
    let promise = client.send_async(&request, handlers::string());
    let derived = promise.then_apply(|response| response.into_body());

    assert!(promise.cancel());
    assert!(matches!(promise.wait(), Err(ClientError::Cancelled)));
    assert!(matches!(derived.wait(), Err(ClientError::Cancelled)));

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(transport.executed(), 0);
}

#[test]
fn invalid_body_encoding_is_a_decode_failure() {
    let transport = ScriptedTransport::new();
    transport.route("/todos/1", 200, "{ not json");

    #[derive(Debug, Clone, serde::Deserialize)]
    #[expect(dead_code, reason = "only deserialized")]
    struct Todo {
        title: String,
    }

    let request = Request::builder_with("https://jsonplaceholder.typicode.com/todos/1").build().unwrap();
    let err = client(&transport).send(&request, handlers::json::<Todo>()).unwrap_err();

    assert!(matches!(err, ClientError::DecodeFailed { .. }));
}
