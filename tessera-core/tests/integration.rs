//! Integration Tests for the Directive Engine
//!
//! These tests drive whole render and attach passes through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use tessera_core::directive::{
    AsyncOptions, Directive, DirectiveClass, DirectiveRegistry, Outcome, SsrStrategy,
};
use tessera_core::reactive::{Effect, Store};
use tessera_core::{AsyncFailure, Document, Engine, EngineError, RenderOptions, Scope};

const FALLBACK: &str = "<i>loading</i>";

/// An async directive binding `{"name": "Ada"}` and counting its loads.
fn user_directive(strategy: SsrStrategy, loads: Arc<AtomicUsize>) -> Directive {
    Directive::new("user")
        .template(r#"<span x-text="data.name"></span>"#)
        .asynchronous(
            AsyncOptions::new(move |_| {
                let loads = loads.clone();
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({ "name": "Ada" }))
                }
            })
            .fallback(FALLBACK)
            .strategy(strategy),
        )
}

fn failing_directive(strategy: SsrStrategy, failure: AsyncFailure) -> Directive {
    Directive::new("user")
        .template(r#"<span x-text="data.name"></span>"#)
        .asynchronous(
            AsyncOptions::new(move |_| {
                let failure = failure.clone();
                async move { Err(failure) }
            })
            .fallback(FALLBACK)
            .strategy(strategy),
        )
}

fn engine_with(directive: Directive, options: RenderOptions) -> Engine {
    let mut registry = DirectiveRegistry::with_builtins();
    registry.register(directive).unwrap();
    Engine::builder().registry(registry).options(options).build()
}

/// Reading `user.name` does not subscribe to `user.age`.
#[test]
fn reads_track_exact_paths() {
    let store = Store::new(json!({ "user": { "name": "Ada", "age": 36 }, "other": 1 }));
    let reader = store.clone();
    let effect = Effect::new(move || {
        reader.root().get("user").get("name").value();
    });
    assert_eq!(effect.run_count(), 1);

    store.root().get("user").set("age", json!(37));
    store.root().set("other", json!(2));
    assert_eq!(effect.run_count(), 1);

    store.root().get("user").set("name", json!("Grace"));
    assert_eq!(effect.run_count(), 2);

    // Replacing the parent replaces the path read.
    store.root().set("user", json!({ "name": "Edsger" }));
    assert_eq!(effect.run_count(), 3);

    // Equal writes notify nobody.
    store.root().set("user", json!({ "name": "Edsger" }));
    assert_eq!(effect.run_count(), 3);
}

/// Child scopes read through to the parent and write to the owner.
#[test]
fn scope_writes_reach_the_owner() {
    let store = Store::new(json!({ "count": 0 }));
    let root = Scope::root(store.clone());
    let mut locals = Map::new();
    locals.insert("item".into(), json!("a"));
    let child = root.child(locals);
    let grandchild = child.isolated();

    assert_eq!(grandchild.get("item"), json!("a"));
    assert_eq!(grandchild.get("count"), json!(0));

    grandchild.set("count", json!(5));
    assert_eq!(store.snapshot()["count"], json!(5));
    assert!(!grandchild.locals().snapshot().as_object().unwrap().contains_key("count"));

    grandchild.set("item", json!("b"));
    assert_eq!(child.get("item"), json!("b"));

    grandchild.set("fresh", json!(true));
    assert!(grandchild.contains("fresh"));
    assert!(!child.contains("fresh"));
    assert!(!root.contains("fresh"));
}

#[tokio::test]
async fn scope_initializer_shadows_root_state() {
    let engine = Engine::builder().build();
    let html = engine
        .render(
            r#"<div x-data="{&quot;label&quot;: &quot;inner&quot;}"><p x-text="label"></p></div><p x-text="label"></p>"#,
            json!({ "label": "outer" }),
        )
        .await
        .unwrap();
    assert!(html.contains(r#"<p x-text="label">inner</p></div>"#));
    assert!(html.ends_with(r#"<p x-text="label">outer</p>"#));
}

/// Class first, then priority descending, then name.
#[tokio::test]
async fn directives_run_in_execution_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &str, order: &Arc<Mutex<Vec<String>>>| {
        let order = order.clone();
        Directive::new(name).behavior(move |inv| {
            order.lock().push(inv.directive().to_string());
            Ok(Outcome::Continue)
        })
    };

    let mut registry = DirectiveRegistry::new();
    registry.register(recorder("a", &order).priority(1)).unwrap();
    registry.register(recorder("c", &order).priority(10)).unwrap();
    registry.register(recorder("b", &order).priority(10)).unwrap();
    registry
        .register(
            recorder("gate", &order)
                .class(DirectiveClass::Conditional)
                .priority(-5),
        )
        .unwrap();

    Engine::new(registry)
        .render(r#"<div x-a x-c x-b x-gate></div>"#, json!({}))
        .await
        .unwrap();
    assert_eq!(*order.lock(), vec!["gate", "b", "c", "a"]);
}

#[tokio::test]
async fn missing_dependency_is_reported() {
    struct Mailer {
        from: &'static str,
    }

    let directive = Directive::new("mail")
        .depends_on("mailer")
        .behavior(|inv| {
            let mailer = inv
                .deps()
                .service::<Mailer>("mailer")
                .ok_or_else(|| inv.fail("mailer has the wrong type"))?;
            inv.tree().set_text(inv.node(), mailer.from);
            Ok(Outcome::Continue)
        });

    let mut registry = DirectiveRegistry::new();
    registry.register(directive.clone()).unwrap();
    let err = Engine::new(registry)
        .render(r#"<p x-mail></p>"#, json!({}))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, EngineError::UnresolvedDependency { directive, name } if directive == "mail" && name == "mailer"),
        "unexpected error: {err}"
    );

    let mut registry = DirectiveRegistry::new();
    registry.register(directive).unwrap();
    let html = Engine::builder()
        .registry(registry)
        .service("mailer", Mailer { from: "noreply" })
        .build()
        .render(r#"<p x-mail></p>"#, json!({}))
        .await
        .unwrap();
    assert_eq!(html, r#"<p x-mail>noreply</p>"#);
}

#[tokio::test]
async fn server_output_attaches_without_mutation() {
    let markup = r#"<ul><li x-for="item in items" x-text="item"></li></ul><p :title="title" x-show="open">hi</p>"#;
    let state = json!({ "items": ["a", "b"], "title": "list", "open": true });

    let engine = Engine::builder().build();
    let html = engine.render(markup, state.clone()).await.unwrap();
    assert!(html.contains(r#"<li x-text="item" data-for-index="0">a</li>"#));
    assert!(html.contains(r#"<li x-text="item" data-for-index="1">b</li>"#));
    assert!(html.contains(r#"title="list""#));

    let document = Document::parse(&html).unwrap();
    let nodes = document.node_count();
    let mutations = document.mutation_count();
    let store = Store::new(state);
    let hydration = engine.attach(&document, &store).unwrap();
    hydration.settle().await.unwrap();

    assert_eq!(document.mutation_count(), mutations);
    assert_eq!(document.node_count(), nodes);
    assert_eq!(document.to_markup(), html);
    assert_eq!(document.elements_by_tag("li").len(), 3);

    // Attaching again is a no-op.
    let again = engine.attach(&document, &store).unwrap();
    again.settle().await.unwrap();
    assert_eq!(document.mutation_count(), mutations);
    assert_eq!(document.to_markup(), html);

    // The attached tree follows the state.
    store.root().get("items").set("0", json!("z"));
    store.root().set("title", json!("renamed"));
    assert!(document
        .to_markup()
        .contains(r#"<li x-text="item" data-for-index="0">z</li>"#));
    assert!(document.to_markup().contains(r#"title="renamed""#));

    hydration.stop();
    again.stop();
}

#[tokio::test]
async fn block_renders_the_template() {
    let loads = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        user_directive(SsrStrategy::Block, loads.clone()),
        RenderOptions::default(),
    );
    let html = engine.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
    assert_eq!(
        html,
        r#"<div x-user data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#
    );
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    // The client runs the load again but keeps the content.
    let document = Document::parse(&html).unwrap();
    let mutations = document.mutation_count();
    let hydration = engine.attach(&document, &Store::new(json!({}))).unwrap();
    hydration.settle().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(document.mutation_count(), mutations);
    assert_eq!(document.to_markup(), html);
}

#[tokio::test]
async fn zero_depth_renders_the_fallback() {
    let loads = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        user_directive(SsrStrategy::Block, loads.clone()),
        RenderOptions::default().with_max_depth(0),
    );
    let html = engine.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
    assert_eq!(
        html,
        r#"<div x-user data-async-state="timeout"><i>loading</i></div>"#
    );
    assert!(!html.contains("<span"));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn nesting_beyond_max_depth_times_out() {
    let inner = Directive::new("inner")
        .template("<b>deep</b>")
        .asynchronous(AsyncOptions::new(|_| async { Ok(Value::Null) }).fallback("<i>inner</i>"));
    let outer = Directive::new("outer")
        .template("<section x-inner></section>")
        .asynchronous(AsyncOptions::new(|_| async { Ok(Value::Null) }).fallback("<i>outer</i>"));

    let mut registry = DirectiveRegistry::new();
    registry.register(inner).unwrap();
    registry.register(outer).unwrap();
    let engine = Engine::builder()
        .registry(registry)
        .options(RenderOptions::default().with_max_depth(1))
        .build();

    let html = engine.render(r#"<div x-outer></div>"#, json!({})).await.unwrap();
    assert_eq!(
        html,
        concat!(
            r#"<div x-outer data-async-state="loaded">"#,
            r#"<section x-inner data-async-state="timeout"><i>inner</i></section></div>"#
        )
    );
}

#[tokio::test]
async fn fallback_signal_and_failure_render_pending() {
    for failure in [AsyncFailure::UseFallback, AsyncFailure::failed("backend down")] {
        let engine = engine_with(
            failing_directive(SsrStrategy::Block, failure),
            RenderOptions::default(),
        );
        let html = engine.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
        assert_eq!(
            html,
            r#"<div x-user data-async-state="pending"><i>loading</i></div>"#
        );
    }
}

#[tokio::test]
async fn spent_budget_renders_timeout() {
    let slow = Directive::new("user")
        .template("<span>late</span>")
        .asynchronous(
            AsyncOptions::new(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
            .fallback(FALLBACK),
        );
    let engine = engine_with(
        slow,
        RenderOptions::default().with_timeout(Duration::from_millis(20)),
    );
    let html = engine.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
    assert_eq!(
        html,
        r#"<div x-user data-async-state="timeout"><i>loading</i></div>"#
    );
}

#[tokio::test]
async fn skip_leaves_the_work_to_the_client() {
    let loads = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        user_directive(SsrStrategy::Skip, loads.clone()),
        RenderOptions::default(),
    );
    let html = engine.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
    assert_eq!(
        html,
        r#"<div x-user data-async-state="pending"><i>loading</i></div>"#
    );
    assert_eq!(loads.load(Ordering::SeqCst), 0);

    let document = Document::parse(&html).unwrap();
    let hydration = engine.attach(&document, &Store::new(json!({}))).unwrap();
    hydration.settle().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        document.to_markup(),
        r#"<div x-user data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#
    );
}

#[tokio::test]
async fn failed_client_completion_marks_error() {
    let server = engine_with(
        user_directive(SsrStrategy::Skip, Arc::new(AtomicUsize::new(0))),
        RenderOptions::default(),
    );
    let html = server.render(r#"<div x-user></div>"#, json!({})).await.unwrap();

    let client = engine_with(
        failing_directive(SsrStrategy::Skip, AsyncFailure::failed("offline")),
        RenderOptions::default(),
    );
    let document = Document::parse(&html).unwrap();
    let hydration = client.attach(&document, &Store::new(json!({}))).unwrap();
    hydration.settle().await.unwrap();
    assert_eq!(
        document.to_markup(),
        r#"<div x-user data-async-state="error"><i>loading</i></div>"#
    );
}

#[tokio::test]
async fn streaming_sends_fallback_then_one_unit() {
    let loads = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        user_directive(SsrStrategy::Stream, loads.clone()),
        RenderOptions::default(),
    );
    let chunks: Vec<String> = engine
        .render_stream(r#"<div x-user></div><p x-text="title"></p>"#, json!({ "title": "t" }))
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(
        chunks[0],
        concat!(
            r#"<div x-user data-async-state="streaming" data-async-id="async-0"><i>loading</i></div>"#,
            r#"<p x-text="title">t</p>"#
        )
    );
    assert_eq!(
        chunks[1],
        r#"<template data-async-for="async-0"><span x-text="data.name">Ada</span></template>"#
    );

    // The client waits for the unit, then swaps it in.
    let document = Document::parse(&chunks[0]).unwrap();
    let hydration = engine.attach(&document, &Store::new(json!({ "title": "t" }))).unwrap();
    assert_eq!(hydration.pending_streams(), 1);

    hydration.apply_chunk(&chunks[1]).await.unwrap();
    assert_eq!(hydration.pending_streams(), 0);
    assert_eq!(
        document.to_markup(),
        concat!(
            r#"<div x-user data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#,
            r#"<p x-text="title">t</p>"#
        )
    );
}

#[tokio::test]
async fn streaming_without_a_stream_degrades_to_pending() {
    let loads = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(
        user_directive(SsrStrategy::Stream, loads.clone()),
        RenderOptions::default(),
    );
    let html = engine.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
    assert_eq!(
        html,
        r#"<div x-user data-async-state="pending"><i>loading</i></div>"#
    );
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn streamed_failure_hands_over_to_the_client() {
    let engine = engine_with(
        failing_directive(SsrStrategy::Stream, AsyncFailure::failed("backend down")),
        RenderOptions::default(),
    );
    let chunks: Vec<String> = engine
        .render_stream(r#"<div x-user></div>"#, json!({}))
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(
        chunks[1],
        r#"<template data-async-for="async-0" data-async-state="pending"></template>"#
    );

    let loads = Arc::new(AtomicUsize::new(0));
    let client = engine_with(
        user_directive(SsrStrategy::Stream, loads.clone()),
        RenderOptions::default(),
    );
    let document = Document::parse(&chunks[0]).unwrap();
    let hydration = client.attach(&document, &Store::new(json!({}))).unwrap();
    hydration.apply_chunk(&chunks[1]).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        document.to_markup(),
        r#"<div x-user data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#
    );
}

#[tokio::test]
async fn units_for_unknown_targets_are_held() {
    let engine = engine_with(
        user_directive(SsrStrategy::Stream, Arc::new(AtomicUsize::new(0))),
        RenderOptions::default(),
    );
    let document = Document::parse(r#"<p>static</p>"#).unwrap();
    let hydration = engine.attach(&document, &Store::new(json!({}))).unwrap();

    hydration
        .apply_chunk(r#"<template data-async-for="async-9"><b>late</b></template>"#)
        .await
        .unwrap();
    assert_eq!(hydration.held_units(), 1);
    assert_eq!(document.to_markup(), r#"<p>static</p>"#);

    assert!(hydration.apply_chunk("<p>no units</p>").await.is_err());
}

#[tokio::test]
async fn render_error_is_the_only_stream_item() {
    let engine = Engine::builder().build();
    let chunks: Vec<_> = engine
        .render_stream(r#"<div x-data="[1, 2]"></div>"#, json!({}))
        .collect()
        .await;
    assert_eq!(chunks.len(), 1);
    assert!(matches!(chunks[0], Err(EngineError::Directive { .. })));
}

/// Records the text of its node each time it runs.
fn text_recorder(seen: Arc<Mutex<Vec<String>>>) -> Directive {
    Directive::new("mark").behavior(move |inv| {
        seen.lock().push(inv.tree().text_content(inv.node()));
        Ok(Outcome::Continue)
    })
}

fn streaming_engine(seen: Arc<Mutex<Vec<String>>>) -> Engine {
    let mut registry = DirectiveRegistry::with_builtins();
    registry
        .register(user_directive(SsrStrategy::Stream, Arc::new(AtomicUsize::new(0))).priority(10))
        .unwrap();
    registry.register(text_recorder(seen)).unwrap();
    Engine::new(registry)
}

/// Directives after a streaming one only run on the streamed content.
#[tokio::test]
async fn streaming_node_waits_for_its_unit() {
    let server_seen = Arc::new(Mutex::new(Vec::new()));
    let chunks: Vec<String> = streaming_engine(server_seen.clone())
        .render_stream(r#"<div x-user x-mark></div>"#, json!({}))
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(*server_seen.lock(), vec!["loading"]);

    let client_seen = Arc::new(Mutex::new(Vec::new()));
    let document = Document::parse(&chunks[0]).unwrap();
    let hydration = streaming_engine(client_seen.clone())
        .attach(&document, &Store::new(json!({})))
        .unwrap();
    hydration.settle().await.unwrap();
    assert!(client_seen.lock().is_empty());

    hydration.apply_chunk(&chunks[1]).await.unwrap();
    assert_eq!(*client_seen.lock(), vec!["Ada"]);
    assert_eq!(
        document.to_markup(),
        r#"<div x-user x-mark data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#
    );
    hydration.stop();
}

#[tokio::test]
async fn slow_streamed_unit_times_out() {
    let slow = Directive::new("user")
        .template(r#"<span x-text="data.name"></span>"#)
        .asynchronous(
            AsyncOptions::new(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({ "name": "late" }))
            })
            .fallback(FALLBACK)
            .strategy(SsrStrategy::Stream),
        );
    let engine = engine_with(
        slow,
        RenderOptions::default().with_stream_timeout(Duration::from_millis(20)),
    );
    let chunks: Vec<String> = engine
        .render_stream(r#"<div x-user></div>"#, json!({}))
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(
        chunks[1],
        r#"<template data-async-for="async-0" data-async-state="timeout"></template>"#
    );

    // The client completes the work itself.
    let client = engine_with(
        user_directive(SsrStrategy::Stream, Arc::new(AtomicUsize::new(0))),
        RenderOptions::default(),
    );
    let document = Document::parse(&chunks[0]).unwrap();
    let hydration = client.attach(&document, &Store::new(json!({}))).unwrap();
    hydration.apply_chunk(&chunks[1]).await.unwrap();
    assert_eq!(
        document.to_markup(),
        r#"<div x-user data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#
    );
}

#[tokio::test]
async fn client_resumes_from_timeout_marker() {
    let loads = Arc::new(AtomicUsize::new(0));
    let server = engine_with(
        user_directive(SsrStrategy::Block, loads.clone()),
        RenderOptions::default().with_max_depth(0),
    );
    let html = server.render(r#"<div x-user></div>"#, json!({})).await.unwrap();
    assert!(html.contains(r#"data-async-state="timeout""#));
    assert_eq!(loads.load(Ordering::SeqCst), 0);

    let document = Document::parse(&html).unwrap();
    let hydration = server.attach(&document, &Store::new(json!({}))).unwrap();
    hydration.settle().await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        document.to_markup(),
        r#"<div x-user data-async-state="loaded"><span x-text="data.name">Ada</span></div>"#
    );
}

#[tokio::test]
async fn element_directive_matches_its_tag() {
    let card = Directive::new("card").element().template(r#"<h2 x-text="title"></h2>"#);
    let engine = engine_with(card, RenderOptions::default());
    let html = engine
        .render(
            r#"<x-card></x-card><div x-card></div>"#,
            json!({ "title": "Hi" }),
        )
        .await
        .unwrap();
    assert_eq!(
        html,
        r#"<x-card><h2 x-text="title">Hi</h2></x-card><div x-card></div>"#
    );
}

#[tokio::test]
async fn dropping_a_stream_early_releases_the_engine() {
    let sentinel = Arc::new(());
    let held = sentinel.clone();
    let slow = Directive::new("user")
        .template("<b>late</b>")
        .asynchronous(
            AsyncOptions::new(move |_| {
                let _held = held.clone();
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
            })
            .fallback(FALLBACK)
            .strategy(SsrStrategy::Stream),
        );
    let engine = engine_with(slow, RenderOptions::default());

    let mut stream = engine.render_stream(
        r#"<div x-user></div><ul><li x-for="n in items" x-text="n"></li></ul>"#,
        json!({ "items": [1, 2] }),
    );
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.contains(r#"data-async-state="streaming""#));
    assert!(Arc::strong_count(&sentinel) > 1);

    drop(stream);
    drop(engine);
    assert_eq!(Arc::strong_count(&sentinel), 1);
}

/// Re-rendering a list releases the effect scopes of the old items.
#[tokio::test]
async fn list_updates_do_not_accumulate_scopes() {
    let engine = Engine::builder().build();
    let state = json!({ "items": ["a", "b", "c"] });
    let html = engine
        .render(r#"<ul><li x-for="item in items" x-text="item"></li></ul>"#, state.clone())
        .await
        .unwrap();

    let document = Document::parse(&html).unwrap();
    let store = Store::new(state);
    let hydration = engine.attach(&document, &store).unwrap();
    let template = document.elements_by_tag("template")[0];
    let frame = hydration.frame_of(template).unwrap();

    for i in 0..100 {
        store.root().get("items").set("0", json!(i));
    }
    assert!(document.to_markup().contains(">99</li>"));
    assert_eq!(frame.effects().child_count(), 3);
    hydration.stop();
}
