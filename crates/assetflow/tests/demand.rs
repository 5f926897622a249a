//! Demand accounting and lifecycle of network fetches, driven through a
//! scripted transport so every byte arrival is under the test's control.

mod common;

use assetflow::{
    AssetFetcher, Completion, Connectivity, Demand, FetchConfig, FetchEnv, FetchError,
    Subscription, source::HttpTransport,
};
use bytes::Bytes;
use common::{Recorder, ScriptedTransport, completion, concat, lengths, settle};
use std::sync::Arc;

fn scripted_env(connectivity: Connectivity) -> (Arc<FetchEnv>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let env = FetchEnv::builder(FetchConfig::default())
        .connectivity(connectivity)
        .transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
        .build()
        .expect("failed to build env");
    (env, transport)
}

fn fetcher(env: &Arc<FetchEnv>) -> AssetFetcher {
    AssetFetcher::parse(Arc::clone(env), "https://assets.example.com/hero.png").unwrap()
}

fn body(len: usize) -> Bytes {
    Bytes::from(common::pattern(len))
}

/// Every byte read is either delivered or parked.
fn assert_conserved(subscription: &Subscription) {
    let stats = subscription.stats();
    assert_eq!(stats.delivered + stats.parked as u64, stats.read, "{stats:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accumulated_demand_caps_delivery() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, _done) = Recorder::new(Demand::none(), Demand::none());
    let subscription = fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    subscription.request(Demand::max(2000));
    subscription.request(Demand::max(3000));
    sink.response(200);
    sink.data(body(4096));
    settle(&env).await;

    assert_eq!(lengths(&chunks), vec![4096]);
    assert_eq!(subscription.stats().demand, Demand::max(904));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surplus_is_parked_until_demand_returns() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, _done) = Recorder::new(Demand::max(1000), Demand::none());
    let subscription = fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(200);
    sink.data(body(4096));
    settle(&env).await;

    assert_eq!(lengths(&chunks), vec![1000]);
    assert_eq!(subscription.stats().parked, 3096);
    assert_conserved(&subscription);

    subscription.request(Demand::max(3096));
    settle(&env).await;

    assert_eq!(lengths(&chunks), vec![1000, 3096]);
    assert_eq!(concat(&chunks), body(4096).to_vec());
    assert_eq!(subscription.stats().parked, 0);
    assert_conserved(&subscription);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_bytes_are_delivered_or_parked() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, done) = Recorder::new(Demand::none(), Demand::none());
    let subscription = fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(200);
    let payload = body(9000);
    let mut demands = [300usize, 0, 2500, 1, 0, 4000].into_iter();
    for piece in payload.chunks(1500) {
        sink.data(payload.slice_ref(piece));
        settle(&env).await;
        assert_conserved(&subscription);

        if let Some(n) = demands.next().filter(|n| *n > 0) {
            subscription.request(Demand::max(n));
            settle(&env).await;
            assert_conserved(&subscription);
        }
    }
    sink.complete(None);
    settle(&env).await;
    assert_conserved(&subscription);
    assert!(subscription.stats().parked > 0);

    subscription.request(Demand::UNBOUNDED);
    assert_eq!(completion(done).await, Completion::Finished);
    assert_eq!(concat(&chunks), payload.to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_without_response_fails() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.complete(None);

    assert!(matches!(
        completion(done).await,
        Completion::Failed(FetchError::Transport(_))
    ));
    settle(&env).await;
    assert!(chunks.lock().is_empty());
    assert!(env.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_is_deferred_until_tail_is_flushed() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, done) = Recorder::new(Demand::none(), Demand::none());
    let subscription = fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(200);
    sink.data(Bytes::from_static(b"0123456789"));
    sink.complete(None);
    settle(&env).await;

    assert!(chunks.lock().is_empty());
    assert!(!subscription.is_completed());
    assert_eq!(subscription.stats().parked, 10);

    subscription.request(Demand::UNBOUNDED);
    assert_eq!(completion(done).await, Completion::Finished);
    assert_eq!(concat(&chunks), b"0123456789".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_200_status_fails_and_releases_the_task() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(404);
    sink.data(body(100));

    assert_eq!(
        completion(done).await,
        Completion::Failed(FetchError::HttpStatus(404))
    );
    settle(&env).await;
    assert!(chunks.lock().is_empty());
    assert!(env.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_error_discards_parked_bytes() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, done) = Recorder::new(Demand::none(), Demand::none());
    let subscription = fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(200);
    sink.data(body(512));
    settle(&env).await;
    sink.complete(Some(FetchError::Transport("connection reset".to_string())));

    assert_eq!(
        completion(done).await,
        Completion::Failed(FetchError::Transport("connection reset".to_string()))
    );
    assert!(chunks.lock().is_empty());
    assert_eq!(subscription.stats().parked, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offline_fails_fast_without_a_request() {
    let (env, transport) = scripted_env(Connectivity::new(false));
    let (recorder, _chunks, done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    fetcher(&env).subscribe(recorder);

    assert_eq!(
        completion(done).await,
        Completion::Failed(FetchError::NotReachable)
    );
    assert_eq!(transport.requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offline_is_ignored_when_fail_fast_is_off() {
    let transport = Arc::new(ScriptedTransport::default());
    let env = FetchEnv::builder(FetchConfig {
        fail_fast_offline: false,
        ..FetchConfig::default()
    })
    .connectivity(Connectivity::new(false))
    .transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
    .build()
    .unwrap();

    let (recorder, chunks, done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(200);
    sink.data(Bytes::from_static(b"still here"));
    sink.complete(None);

    assert_eq!(completion(done).await, Completion::Finished);
    assert_eq!(concat(&chunks), b"still here".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_silences_later_transport_callbacks() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, chunks, done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    let subscription = fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    subscription.cancel();
    subscription.cancel();

    sink.response(200);
    sink.data(body(2048));
    sink.complete(None);
    settle(&env).await;

    assert!(chunks.lock().is_empty());
    assert!(done.await.is_err());
    assert!(env.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_from_inside_on_next_stops_delivery() {
    use assetflow::{Subscriber, Subscription};
    use parking_lot::Mutex;

    struct CancelAfterFirst {
        subscription: Option<Subscription>,
        seen: Arc<Mutex<usize>>,
    }

    impl Subscriber for CancelAfterFirst {
        fn on_subscribe(&mut self, subscription: Subscription) {
            subscription.request(Demand::max(10));
            self.subscription = Some(subscription);
        }
        fn on_next(&mut self, _chunk: Bytes) -> Demand {
            *self.seen.lock() += 1;
            if let Some(subscription) = self.subscription.take() {
                subscription.cancel();
            }
            Demand::UNBOUNDED
        }
        fn on_complete(&mut self, _completion: Completion) {
            *self.seen.lock() += 100;
        }
    }

    let (env, transport) = scripted_env(Connectivity::new(true));
    let seen = Arc::new(Mutex::new(0));
    let subscription = fetcher(&env).subscribe(CancelAfterFirst {
        subscription: None,
        seen: Arc::clone(&seen),
    });

    let sink = transport.sink(0).await;
    sink.response(200);
    sink.data(body(100));
    settle(&env).await;
    sink.data(body(100));
    sink.complete(None);
    settle(&env).await;

    assert_eq!(*seen.lock(), 1);
    assert!(subscription.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_subscription_gets_its_own_task() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let fetcher = fetcher(&env);

    let (first, first_chunks, first_done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    let (second, second_chunks, second_done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    fetcher.subscribe(first);
    fetcher.subscribe(second);

    let a = transport.sink(0).await;
    let b = transport.sink(1).await;
    assert_ne!(a.id(), b.id());

    a.response(200);
    b.response(200);
    a.data(Bytes::from_static(b"first"));
    b.data(Bytes::from_static(b"second"));
    a.complete(None);
    b.complete(None);

    assert_eq!(completion(first_done).await, Completion::Finished);
    assert_eq!(completion(second_done).await, Completion::Finished);
    assert_eq!(concat(&first_chunks), b"first".to_vec());
    assert_eq!(concat(&second_chunks), b"second".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_releases_in_flight_tasks() {
    let (env, transport) = scripted_env(Connectivity::new(true));
    let (recorder, _chunks, done) = Recorder::new(Demand::UNBOUNDED, Demand::none());
    fetcher(&env).subscribe(recorder);

    let sink = transport.sink(0).await;
    sink.response(200);
    settle(&env).await;
    assert_eq!(env.registry().len(), 1);

    env.shutdown().await;
    env.shutdown().await;

    assert_eq!(completion(done).await, Completion::Failed(FetchError::Shutdown));
    assert!(env.is_shutdown());
    assert!(env.registry().is_empty());
    assert!(env.queue().is_shutdown());
}
