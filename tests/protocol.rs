//! End-to-end protocol behavior across operator chains and real threads.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rivulet::prelude::*;
use rivulet::testkit::{Signal, TestPublisher, TestSubscriber};

const WAIT: Duration = Duration::from_secs(10);

fn scheduler() -> Arc<dyn Scheduler> {
  Arc::new(CachedThreadScheduler::new())
}

#[test]
fn zip_across_an_async_boundary_stays_in_lockstep() {
  let sd = scheduler();
  let numbers = ObserveOn::new(
    from_iter(0..50) as Arc<dyn Publisher<i32>>,
    sd.clone(),
  );
  let doubles = from_iter((0..50).map(|v| v * 2)) as Arc<dyn Publisher<i32>>;
  let zip = Zip::new(
    vec![
      Source::Stream(Arc::new(numbers) as Arc<dyn Publisher<i32>>),
      Source::Stream(doubles),
    ],
    |row| row[0] + row[1],
    16,
  );
  let ts = TestSubscriber::<i32>::new();
  zip.subscribe(ts.clone());
  assert!(ts.await_terminal(WAIT));
  assert_eq!(ts.values(), (0..50).map(|v| v * 3).collect::<Vec<_>>());
  assert!(ts.is_complete());
  assert_eq!(ts.subscribe_count(), 1);
  sd.shutdown();
}

#[test]
fn observe_on_preserves_order_under_batched_demand() {
  let sd = scheduler();
  // The second boundary sees a plain upstream, exercising the owned
  // prefetch queue rather than fusion.
  let first = ObserveOn::new(
    from_iter(1..=1000) as Arc<dyn Publisher<i32>>,
    sd.clone(),
  );
  let second = ObserveOn::with(
    Arc::new(first) as Arc<dyn Publisher<i32>>,
    sd.clone(),
    false,
    32,
  );
  let ts = TestSubscriber::<i32>::with_request(0);
  second.subscribe(ts.clone());

  let mut granted = 0usize;
  while granted < 1000 {
    ts.request(7);
    granted += 7;
    assert!(ts.await_items(granted.min(1000), WAIT));
  }
  assert!(ts.await_terminal(WAIT));
  assert_eq!(ts.values(), (1..=1000).collect::<Vec<_>>());
  assert!(ts.is_complete());
  sd.shutdown();
}

#[test]
fn reduce_full_sums_rails_across_threads() {
  let sd = scheduler();
  let rails: Vec<Arc<dyn Publisher<i64>>> = (0..4)
    .map(|rail| {
      let base = rail as i64 * 25 + 1;
      Arc::new(ObserveOn::new(
        from_iter(base..base + 25) as Arc<dyn Publisher<i64>>,
        sd.clone(),
      )) as Arc<dyn Publisher<i64>>
    })
    .collect();
  let op = ReduceFull::new(rails, |a, b| a + b);
  let ts = TestSubscriber::<i64>::new();
  op.subscribe(ts.clone());
  assert!(ts.await_terminal(WAIT));
  assert_eq!(ts.signals(), vec![Signal::Next(5050), Signal::Complete]);
  sd.shutdown();
}

#[test]
fn take_last_behind_an_async_boundary() {
  let sd = scheduler();
  let boundary = ObserveOn::new(
    from_iter(0..500) as Arc<dyn Publisher<i32>>,
    sd.clone(),
  );
  let op = TakeLast::new(Arc::new(boundary) as Arc<dyn Publisher<i32>>, 3);
  let ts = TestSubscriber::<i32>::new();
  op.subscribe(ts.clone());
  assert!(ts.await_terminal(WAIT));
  assert_eq!(ts.values(), vec![497, 498, 499]);
  sd.shutdown();
}

#[test]
fn cancellation_racing_completion_yields_at_most_one_terminal() {
  let sd = scheduler();
  for _ in 0..50 {
    let tp = TestPublisher::<i32>::new();
    let op = ObserveOn::with(
      tp.clone() as Arc<dyn Publisher<i32>>,
      sd.clone(),
      false,
      64,
    );
    let ts = TestSubscriber::<i32>::new();
    op.subscribe(ts.clone());

    let producer = {
      let tp = tp.clone();
      thread::spawn(move || {
        for i in 0..32 {
          tp.next(i);
        }
        tp.complete();
      })
    };
    let canceller = {
      let ts = ts.clone();
      thread::spawn(move || ts.cancel())
    };
    producer.join().unwrap();
    canceller.join().unwrap();
    // Give any in-flight drain a moment to finish misbehaving, if it were
    // going to.
    thread::sleep(Duration::from_millis(10));

    assert!(ts.terminal_count() <= 1, "more than one terminal observed");
    let signals = ts.signals();
    if let Some(pos) =
      signals.iter().position(|s| !matches!(s, Signal::Next(_)))
    {
      assert_eq!(pos, signals.len() - 1, "signal after a terminal");
    }
    let values = ts.values();
    assert_eq!(values, (0..values.len() as i32).collect::<Vec<_>>());
  }
  sd.shutdown();
}

#[test]
fn join_correlates_across_manual_windows() {
  let left = TestPublisher::<&'static str>::new();
  let right = TestPublisher::<&'static str>::new();
  let left_window = TestPublisher::<()>::new();

  let lw = left_window.clone();
  let join = Join::new(
    left.clone() as Arc<dyn Publisher<&'static str>>,
    right.clone() as Arc<dyn Publisher<&'static str>>,
    move |_l| lw.clone() as Arc<dyn Publisher<()>>,
    |_r| TestPublisher::<()>::new() as Arc<dyn Publisher<()>>,
    |l, r| format!("{l}{r}"),
  );
  let ts = TestSubscriber::<String>::new();
  join.subscribe(ts.clone());

  left.next("L1");
  right.next("R1");
  left_window.next(());
  right.next("R2");
  left.complete();
  right.complete();

  assert!(ts.is_complete());
  assert_eq!(ts.values(), vec!["L1R1".to_owned()]);
}

#[test]
fn demand_is_never_exceeded_across_a_chain() {
  let tp = TestPublisher::<i32>::new();
  let ts = TestSubscriber::<i32>::with_request(0);
  let op = TakeLast::new(tp.clone() as Arc<dyn Publisher<i32>>, 4);
  op.subscribe(ts.clone());
  for i in 0..20 {
    tp.next(i);
  }
  tp.complete();
  ts.request(1);
  ts.request(1);
  assert_eq!(ts.values().len(), 2);
  ts.request(UNBOUNDED);
  assert_eq!(ts.values(), vec![16, 17, 18, 19]);
  assert!(ts.is_complete());
}
