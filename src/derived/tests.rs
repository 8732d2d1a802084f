use super::*;
use crate::test_helpers::*;
use crate::{ServerError, Subscription, VariableInput};
use assert_call::{call, CallRecorder};
use rt_local::{runtime::core::test, spawn_local, wait_for_idle};
use serde_json::json;

#[test]
async fn resolve_sends_resolved_dependency_values() {
    let (_sync, _ws, backend, resolver) = setup();
    let def = derived(
        "d",
        vec![
            input_var_with_default("a", json!(1)),
            VariableInput::Literal(json!(5)),
        ],
    );
    let value = resolver.derived_client(&def).resolve(&resolver, false).await;
    assert_eq!(value, Ok(json!([1, 5])));

    let calls = backend.compute_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].uid, "d");
    assert_eq!(calls[0].values, vec![json!(1), json!(5)]);
    assert!(!calls[0].force);
}

#[test]
async fn unchanged_fingerprint_serves_cache() {
    let (_sync, _ws, backend, resolver) = setup();
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);
    client.resolve(&resolver, false).await.unwrap();
    client.resolve(&resolver, false).await.unwrap();
    assert_eq!(backend.compute_calls().len(), 1);
}

#[test]
async fn changed_dependency_recomputes() {
    let (_sync, _ws, backend, resolver) = setup();
    let a = var_with_default("a", json!(1));
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);

    assert_eq!(client.resolve(&resolver, false).await, Ok(json!([1])));
    resolver.set(&a, json!(2));
    assert_eq!(client.resolve(&resolver, false).await, Ok(json!([2])));
    assert_eq!(backend.compute_calls().len(), 2);
}

#[test]
async fn deps_allowlist_limits_recompute() {
    let (_sync, _ws, backend, resolver) = setup();
    let mut def = derived(
        "d",
        vec![
            input_var_with_default("a", json!(1)),
            input_var_with_default("b", json!(10)),
        ],
    );
    def.deps = Some(vec!["a".to_string()]);
    let client = resolver.derived_client(&def);

    assert_eq!(client.resolve(&resolver, false).await, Ok(json!([1, 10])));

    // A non-allowlisted change is served from cache, stale values and all.
    resolver.set(&var("b"), json!(20));
    assert_eq!(client.resolve(&resolver, false).await, Ok(json!([1, 10])));
    assert_eq!(backend.compute_calls().len(), 1);

    resolver.set(&var("a"), json!(2));
    assert_eq!(client.resolve(&resolver, false).await, Ok(json!([2, 20])));
    assert_eq!(backend.compute_calls().len(), 2);
}

#[test]
async fn concurrent_resolves_share_one_request() {
    let sync = StateSynchronizer::new();
    let ws = StubWsClient::new();
    let backend = StubBackend::manual();
    let resolver = Resolver::new(sync, Rc::new(ws), Rc::new(backend.clone()));
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);

    let (c1, r1) = (client.clone(), resolver.clone());
    let first = spawn_local(async move { c1.resolve(&r1, false).await });
    let (c2, r2) = (client.clone(), resolver.clone());
    let second = spawn_local(async move { c2.resolve(&r2, false).await });
    wait_for_idle().await;
    assert_eq!(backend.compute_calls().len(), 1);

    backend.respond(Ok(ComputeResponse::Value(json!(42))));
    assert_eq!(first.await, Ok(json!(42)));
    assert_eq!(second.await, Ok(json!(42)));
    assert_eq!(backend.compute_calls().len(), 1);
}

#[test]
async fn server_trigger_invalidates_cache() {
    let (_sync, ws, backend, resolver) = setup();
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);

    client.resolve(&resolver, false).await.unwrap();
    client.resolve(&resolver, false).await.unwrap();
    assert_eq!(backend.compute_calls().len(), 1);

    ws.push_trigger("d");
    client.resolve(&resolver, false).await.unwrap();
    let calls = backend.compute_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].force);

    // The trigger is consumed by the recompute.
    client.resolve(&resolver, false).await.unwrap();
    assert_eq!(backend.compute_calls().len(), 2);
}

#[test]
async fn trigger_during_inflight_request_still_invalidates() {
    let sync = StateSynchronizer::new();
    let ws = StubWsClient::new();
    let backend = StubBackend::manual();
    let resolver = Resolver::new(sync, Rc::new(ws.clone()), Rc::new(backend.clone()));
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);

    let (c1, r1) = (client.clone(), resolver.clone());
    let first = spawn_local(async move { c1.resolve(&r1, false).await });
    wait_for_idle().await;

    // The trigger lands while the first request is in flight; the second
    // resolve observes it and still joins the in-flight request.
    ws.push_trigger("d");
    let (c2, r2) = (client.clone(), resolver.clone());
    let second = spawn_local(async move { c2.resolve(&r2, false).await });
    wait_for_idle().await;
    assert_eq!(backend.compute_calls().len(), 1);

    backend.respond(Ok(ComputeResponse::Value(json!(1))));
    first.await.unwrap();
    second.await.unwrap();

    // The trigger outlives the request it raced with: the next access
    // recomputes instead of serving the pre-trigger cache.
    let (c3, r3) = (client.clone(), resolver.clone());
    let third = spawn_local(async move { c3.resolve(&r3, false).await });
    wait_for_idle().await;
    backend.respond(Ok(ComputeResponse::Value(json!(2))));
    assert_eq!(third.await, Ok(json!(2)));
    let calls = backend.compute_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].force);

    // Consumed: a fourth access serves the fresh cache.
    assert_eq!(client.resolve(&resolver, false).await, Ok(json!(2)));
    assert_eq!(backend.compute_calls().len(), 2);
}

#[test]
async fn long_running_task_funnels_through_task_stream() {
    let (sync, ws, backend, resolver) = setup();
    backend.push_response(Ok(ComputeResponse::Task {
        task_id: "t1".to_string(),
    }));
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);

    let mut cr = CallRecorder::new();
    let sub: Subscription = sync.subscribe("d", |u| call!("{}", u.value()));
    cr.verify("null");

    let (c, r) = (client.clone(), resolver.clone());
    let handle = spawn_local(async move { c.resolve(&r, false).await });
    wait_for_idle().await;
    assert!(client.latest().is_pending());

    ws.push_task_update("t1", TaskUpdate::Progress { progress: 0.5 });
    ws.push_task_update(
        "t1",
        TaskUpdate::Complete {
            result: json!("done"),
        },
    );
    assert_eq!(handle.await, Ok(json!("done")));
    assert_eq!(client.latest(), Loadable::Resolved(json!("done")));
    cr.verify("\"done\"");
    drop(sub);
}

#[test]
async fn failed_task_rejects() {
    let (_sync, ws, backend, resolver) = setup();
    backend.push_response(Ok(ComputeResponse::Task {
        task_id: "t1".to_string(),
    }));
    let def = derived("d", vec![]);
    let client = resolver.derived_client(&def);

    let (c, r) = (client.clone(), resolver.clone());
    let handle = spawn_local(async move { c.resolve(&r, false).await });
    wait_for_idle().await;
    ws.push_task_update(
        "t1",
        TaskUpdate::Failed {
            error: "boom".to_string(),
        },
    );
    assert_eq!(handle.await, Err(ResolveError::TaskFailed("boom".into())));
    assert_eq!(
        client.latest(),
        Loadable::Failed(ResolveError::TaskFailed("boom".into()))
    );
}

#[test]
async fn server_error_rejects_without_retry() {
    let (_sync, _ws, backend, resolver) = setup();
    backend.push_response(Err(ServerError::Server {
        status: 500,
        message: "bad".to_string(),
    }));
    let def = derived("d", vec![input_var_with_default("a", json!(1))]);
    let client = resolver.derived_client(&def);

    let result = client.resolve(&resolver, false).await;
    assert!(matches!(result, Err(ResolveError::Server(_))));
    assert_eq!(backend.compute_calls().len(), 1);

    // The next access is a fresh attempt; nothing was cached.
    assert_eq!(client.resolve(&resolver, false).await, Ok(json!([1])));
    assert_eq!(backend.compute_calls().len(), 2);
}

#[test]
fn fingerprint_is_structural_and_order_sensitive() {
    let a = [json!(1), json!(2)];
    let b = [json!(2), json!(1)];
    assert_eq!(fingerprint("d", &a), fingerprint("d", &a));
    assert_ne!(fingerprint("d", &a), fingerprint("d", &b));
    assert_ne!(fingerprint("d", &a), fingerprint("e", &a));
}
