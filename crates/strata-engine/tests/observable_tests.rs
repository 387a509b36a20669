//! Integration tests for observable delivery, acks, redelivery, and
//! lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use strata_engine::{
    Account, AckPolicy, Delivery, EngineConfig, MsgSetConfig, Observable, ObservableConfig,
    ReplayPolicy, Server, StartPosition, StorageType, Transport,
};
use strata_transport_memory::MemoryBus;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn setup() -> (Arc<MemoryBus>, Arc<Server>, Arc<Account>, tempfile::TempDir) {
    let bus = MemoryBus::new();
    let server = Server::new(bus.clone());
    let dir = tempfile::tempdir().expect("tempdir");
    server
        .enable_jetstream(Some(EngineConfig {
            max_memory: 1 << 30,
            max_storage: 1 << 30,
            store_dir: dir.path().to_path_buf(),
        }))
        .await
        .expect("enable jetstream");
    let account = server.global_account().await;
    (bus, server, account, dir)
}

async fn eventually<F, Fut>(label: &str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if f().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {label}");
}

async fn publish_ok(bus: &Arc<MemoryBus>, subject: &str, payload: &'static [u8]) {
    let resp = bus
        .request(subject, Bytes::from_static(payload), Duration::from_millis(500))
        .await
        .expect("pub-ack");
    assert_eq!(resp.payload, Bytes::from_static(b"+OK"));
}

async fn get_next(bus: &Arc<MemoryBus>, obs: &Arc<Observable>) -> Delivery {
    bus.request(
        &obs.request_next_msg_subject(),
        Bytes::new(),
        Duration::from_secs(2),
    )
    .await
    .expect("next message")
}

async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("subscription closed")
}

fn inbox() -> String {
    format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
}

async fn ack(bus: &Arc<MemoryBus>, reply: &str) {
    bus.publish(reply, None, Bytes::new()).await.unwrap();
}

#[tokio::test]
async fn create_observable_validation() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("foo");
            c.subjects = vec!["foo".into(), "bar".into()];
            c
        })
        .await
        .unwrap();

    // Pull with default (none) ack policy.
    assert!(mset.add_observable(ObservableConfig::default()).await.is_err());

    // Delivery subject must be literal.
    let mut c = ObservableConfig::default();
    c.delivery_subject = Some("foo.*".into());
    assert!(mset.add_observable(c).await.is_err());

    // Delivery subject covered by the set's own filters self-ingests.
    for cycle in ["foo", "bar", "*"] {
        let mut c = ObservableConfig::default();
        c.delivery_subject = Some(cycle.into());
        assert!(mset.add_observable(c).await.is_err());
    }

    // Partition is incompatible with cumulative ack.
    let delivery = inbox();
    let (_sid, _rx) = bus.subscribe(&delivery).await.unwrap();
    let mut c = ObservableConfig::push_all(delivery.clone());
    c.partition = Some("foo".into());
    c.ack_policy = AckPolicy::All;
    assert!(mset.add_observable(c).await.is_err());

    // Ephemeral push delivery requires interest at creation.
    let mut c = ObservableConfig::default();
    c.delivery_subject = Some(inbox());
    assert!(mset.add_observable(c).await.is_err());

    // With a listener the same shape succeeds.
    let obs = mset
        .add_observable(ObservableConfig::push_all(delivery))
        .await
        .unwrap();
    assert!(!obs.name().is_empty());
    assert_eq!(mset.num_observables().await, 1);
    obs.delete().await.unwrap();
    assert_eq!(mset.num_observables().await, 0);
}

#[tokio::test]
async fn push_delivery_start_positions() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("MSET");
            c.subjects = vec!["foo.*".into()];
            c
        })
        .await
        .unwrap();

    for _ in 0..10 {
        publish_ok(&bus, "foo.bar", b"Hello World!").await;
    }

    // DeliverAll.
    let delivery = inbox();
    let (sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable(ObservableConfig::push_all(delivery))
        .await
        .unwrap();
    for i in 1..=10u64 {
        let m = recv(&mut rx).await;
        assert_eq!(m.subject, "foo.bar");
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
    }
    publish_ok(&bus, "foo.baz", b"again").await;
    let m = recv(&mut rx).await;
    assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(11));
    obs.delete().await.unwrap();
    bus.unsubscribe(sid).await;
    drop(rx);

    // DeliverLast: exactly one message, deliver seq 1.
    let delivery = inbox();
    let (sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::push_all(delivery);
            c.start = StartPosition::Last;
            c
        })
        .await
        .unwrap();
    let m = recv(&mut rx).await;
    let info = obs.reply_info(m.reply.as_deref().unwrap()).unwrap();
    assert_eq!(info.deliver_seq, 1);
    assert_eq!(info.store_seq, 11);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    obs.delete().await.unwrap();
    bus.unsubscribe(sid).await;
    drop(rx);

    // Default start is new-only.
    let delivery = inbox();
    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::default();
            c.delivery_subject = Some(delivery);
            c
        })
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    publish_ok(&bus, "foo.new", b"fresh").await;
    let m = recv(&mut rx).await;
    let info = obs.reply_info(m.reply.as_deref().unwrap()).unwrap();
    assert_eq!(info.store_seq, 12);
    assert_eq!(info.deliver_seq, 1);
    obs.delete().await.unwrap();

    // Start by sequence, clamped to the first available.
    let delivery = inbox();
    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::push_all(delivery);
            c.start = StartPosition::BySeq(5);
            c
        })
        .await
        .unwrap();
    let m = recv(&mut rx).await;
    assert_eq!(
        obs.reply_info(m.reply.as_deref().unwrap()).unwrap().store_seq,
        5
    );
    obs.delete().await.unwrap();
}

#[tokio::test]
async fn basic_work_queue_pull() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("MY_MSG_SET");
            c.subjects = vec!["foo".into(), "bar".into()];
            c
        })
        .await
        .unwrap();

    let obs = mset
        .add_observable(ObservableConfig::worker("WQ"))
        .await
        .unwrap();
    assert_eq!(obs.next_seq().await, 1);

    for _ in 0..100 {
        publish_ok(&bus, "bar", b"Hello World!").await;
    }
    assert_eq!(mset.stats().await.msgs, 100);

    for i in 1..=100u64 {
        let m = get_next(&bus, &obs).await;
        assert_eq!(m.subject, "bar");
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
    }

    // A request parked before the publish is served by it.
    let bus2 = bus.clone();
    let publisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        publish_ok(&bus2, "bar", b"Hello World!").await;
    });
    let start = Instant::now();
    let m = get_next(&bus, &obs).await;
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(101));
    publisher.await.unwrap();
}

#[tokio::test]
async fn work_queue_request_batch() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("BATCH");
            c.subjects = vec!["bar".into()];
            c
        })
        .await
        .unwrap();
    let obs = mset
        .add_observable(ObservableConfig::worker("WQ"))
        .await
        .unwrap();

    for _ in 0..100 {
        publish_ok(&bus, "bar", b"Hello World!").await;
    }

    let reply = inbox();
    let (_sid, mut rx) = bus.subscribe(&reply).await.unwrap();
    bus.publish(
        &obs.request_next_msg_subject(),
        Some(&reply),
        Bytes::from_static(b"50"),
    )
    .await
    .unwrap();

    for i in 1..=50u64 {
        let m = recv(&mut rx).await;
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
    }
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn work_queue_ack_and_next() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("CHAIN");
            c.subjects = vec!["bar".into()];
            c
        })
        .await
        .unwrap();
    let obs = mset
        .add_observable(ObservableConfig::worker("WQ"))
        .await
        .unwrap();

    for _ in 0..100 {
        publish_ok(&bus, "bar", b"Hello World!").await;
    }

    let reply = inbox();
    let (_sid, mut rx) = bus.subscribe(&reply).await.unwrap();
    bus.publish(&obs.request_next_msg_subject(), Some(&reply), Bytes::new())
        .await
        .unwrap();

    for i in 1..=100u64 {
        let m = recv(&mut rx).await;
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
        // Ack and pull the next in one message.
        bus.publish(
            m.reply.as_deref().unwrap(),
            Some(&reply),
            Bytes::from_static(b"+NXT"),
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn partitioned_push_delivery() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("MSET");
            c.subjects = vec!["foo.*".into()];
            c
        })
        .await
        .unwrap();

    for _ in 0..50 {
        publish_ok(&bus, "foo.A", b"Hello World!").await;
        publish_ok(&bus, "foo.B", b"Hello World!").await;
    }
    assert_eq!(mset.stats().await.msgs, 100);

    let delivery = inbox();
    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::push_all(delivery);
            c.partition = Some("foo.B".into());
            c
        })
        .await
        .unwrap();

    for i in 1..=50u64 {
        let m = recv(&mut rx).await;
        assert_eq!(m.subject, "foo.B");
        let info = obs.reply_info(m.reply.as_deref().unwrap()).unwrap();
        // Skipped partition misses advance the store cursor only.
        assert_eq!(info.deliver_seq, i);
        assert_eq!(info.store_seq, i * 2);
        ack(&bus, m.reply.as_deref().unwrap()).await;
    }
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn redeliver_count_increments() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account.add_msg_set(MsgSetConfig::new("DC")).await.unwrap();
    for _ in 0..10 {
        publish_ok(&bus, "DC", b"OK!").await;
    }

    let obs = mset
        .add_observable(ObservableConfig::worker("WQ"))
        .await
        .unwrap();

    for i in 1..=10u64 {
        let m = get_next(&bus, &obs).await;
        let info = obs.reply_info(m.reply.as_deref().unwrap()).unwrap();
        // The nak keeps handing back store sequence 1.
        assert_eq!(info.store_seq, 1);
        assert_eq!(info.deliver_seq, i);
        assert_eq!(info.deliver_count, i);
        bus.publish(m.reply.as_deref().unwrap(), None, Bytes::from_static(b"-NAK"))
            .await
            .unwrap();
        let o = obs.clone();
        eventually("nak queued for redelivery", || {
            let o = o.clone();
            async move { o.info().await.num_redelivered == 1 }
        })
        .await;
    }
}

#[tokio::test]
async fn cannot_nak_what_was_acked() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account.add_msg_set(MsgSetConfig::new("DC")).await.unwrap();
    for _ in 0..10 {
        publish_ok(&bus, "DC", b"OK!").await;
    }

    let obs = mset
        .add_observable(ObservableConfig::worker("WQ"))
        .await
        .unwrap();

    for i in 1..=10u64 {
        let m = get_next(&bus, &obs).await;
        if i % 2 == 0 {
            ack(&bus, m.reply.as_deref().unwrap()).await;
        }
    }
    let o = obs.clone();
    eventually("evens acked", || {
        let o = o.clone();
        async move { o.info().await.num_pending == 5 }
    })
    .await;

    // Nak already-acked and unknown sequences; none may redeliver.
    for seq in [2u64, 4, 6, 8, 10, 22] {
        let fake = format!("$JS.A.DC.WQ.1.{seq}.{seq}");
        bus.publish(&fake, None, Bytes::from_static(b"-NAK"))
            .await
            .unwrap();
        let err = bus
            .request(
                &obs.request_next_msg_subject(),
                Bytes::new(),
                Duration::from_millis(50),
            )
            .await;
        assert!(err.is_err(), "nak of {seq} should not redeliver");
    }
    assert_eq!(obs.info().await.num_redelivered, 0);
}

#[tokio::test]
async fn stale_ack_next_is_a_noop() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account.add_msg_set(MsgSetConfig::new("DC")).await.unwrap();
    for _ in 0..10 {
        publish_ok(&bus, "DC", b"OK!").await;
    }

    let obs = mset
        .add_observable(ObservableConfig::worker("WQ"))
        .await
        .unwrap();

    let m = get_next(&bus, &obs).await;
    let reply = m.reply.unwrap();
    ack(&bus, &reply).await;
    let o = obs.clone();
    eventually("first message acked", || {
        let o = o.clone();
        async move { o.info().await.num_pending == 0 }
    })
    .await;

    // Ack-and-next for something already acked must not serve a message.
    let stale = inbox();
    let (_sid, mut rx) = bus.subscribe(&stale).await.unwrap();
    bus.publish(&reply, Some(&stale), Bytes::from_static(b"+NXT"))
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    assert_eq!(obs.next_seq().await, 2, "no message may have been drained");

    // A live pending delivery still chains as usual.
    let m = get_next(&bus, &obs).await;
    bus.publish(
        m.reply.as_deref().unwrap(),
        Some(&stale),
        Bytes::from_static(b"+NXT"),
    )
    .await
    .unwrap();
    let m = recv(&mut rx).await;
    assert_eq!(
        obs.reply_info(m.reply.as_deref().unwrap()).unwrap().store_seq,
        3
    );
}

#[tokio::test]
async fn ack_wait_redelivery() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("MY_WQ");
            c.retention = strata_engine::RetentionPolicy::WorkQueue;
            c
        })
        .await
        .unwrap();

    for _ in 0..100 {
        publish_ok(&bus, "MY_WQ", b"Hello World!").await;
    }

    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::worker("PBO");
            c.ack_wait = Duration::from_millis(250);
            c
        })
        .await
        .unwrap();

    // Pull everything without acking.
    for i in 1..=100u64 {
        let m = get_next(&bus, &obs).await;
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
    }
    assert_eq!(mset.stats().await.msgs, 100);

    let o = obs.clone();
    eventually("ack wait expired", || {
        let o = o.clone();
        async move { o.info().await.num_redelivered == 100 }
    })
    .await;

    // Second round: fresh deliver sequences, bumped delivery counts.
    let mut last_dseq = 100;
    for _ in 0..100 {
        let m = get_next(&bus, &obs).await;
        let info = obs.reply_info(m.reply.as_deref().unwrap()).unwrap();
        assert!(info.deliver_seq > last_dseq && info.deliver_seq <= 200);
        last_dseq = info.deliver_seq;
        assert_eq!(info.deliver_count, 2);
        ack(&bus, m.reply.as_deref().unwrap()).await;
    }

    let m = mset.clone();
    eventually("work queue drained", || {
        let m = m.clone();
        async move { m.stats().await.msgs == 0 }
    })
    .await;
}

#[tokio::test]
async fn working_indicator_extends_ack_wait() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("MY_WQ");
            c.retention = strata_engine::RetentionPolicy::WorkQueue;
            c
        })
        .await
        .unwrap();

    publish_ok(&bus, "MY_WQ", b"one").await;
    publish_ok(&bus, "MY_WQ", b"two").await;

    let ack_wait = Duration::from_millis(50);
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::worker("WI");
            c.ack_wait = ack_wait;
            c
        })
        .await
        .unwrap();

    // No progress: message one comes back.
    let m1 = get_next(&bus, &obs).await;
    assert_eq!(
        obs.reply_info(m1.reply.as_deref().unwrap()).unwrap().store_seq,
        1
    );
    tokio::time::sleep(2 * ack_wait).await;
    let m1 = get_next(&bus, &obs).await;
    let info = obs.reply_info(m1.reply.as_deref().unwrap()).unwrap();
    assert_eq!(info.store_seq, 1);
    assert_eq!(info.deliver_seq, 2);
    assert!(info.deliver_count > 1);

    // Keep message one alive with progress indicators while pulling
    // message two.
    let reply1 = m1.reply.clone().unwrap();
    let bus2 = bus.clone();
    let keepalive = tokio::spawn(async move {
        for _ in 0..20 {
            bus2.publish(&reply1, None, Bytes::from_static(b"+WPI"))
                .await
                .unwrap();
            tokio::time::sleep(ack_wait / 4).await;
        }
    });

    tokio::time::sleep(ack_wait).await;
    let m2 = get_next(&bus, &obs).await;
    let info2 = obs.reply_info(m2.reply.as_deref().unwrap()).unwrap();
    assert_eq!(info2.store_seq, 2, "message one must not be redelivered");
    keepalive.await.unwrap();

    ack(&bus, m1.reply.as_deref().unwrap()).await;
    ack(&bus, m2.reply.as_deref().unwrap()).await;
    let m = mset.clone();
    eventually("both messages acked away", || {
        let m = m.clone();
        async move { m.stats().await.msgs == 0 }
    })
    .await;
}

#[tokio::test]
async fn ephemeral_observable_expires_without_interest() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("EP");
            c.subjects = vec!["foo.*".into()];
            c
        })
        .await
        .unwrap();

    let delivery = inbox();
    let (sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::default();
            c.delivery_subject = Some(delivery);
            c
        })
        .await
        .unwrap();
    obs.set_active_check_params(Duration::from_millis(50), 2);

    assert!(obs.is_active());
    assert_eq!(mset.num_observables().await, 1);

    publish_ok(&bus, "foo.22", b"x").await;
    let m = recv(&mut rx).await;
    assert_eq!(m.subject, "foo.22");

    // Drop interest; the next delivery attempt notices immediately, the
    // checker destroys the observable after the grace period.
    bus.unsubscribe(sid).await;
    drop(rx);
    publish_ok(&bus, "foo.22", b"x").await;

    let o = obs.clone();
    eventually("observable inactive", || {
        let o = o.clone();
        async move { !o.is_active() }
    })
    .await;
    let m = mset.clone();
    eventually("observable destroyed", || {
        let m = m.clone();
        async move { m.num_observables().await == 0 }
    })
    .await;

    // Without any publish the checker alone expires it.
    let delivery = inbox();
    let (sid, rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::default();
            c.delivery_subject = Some(delivery);
            c
        })
        .await
        .unwrap();
    obs.set_active_check_params(Duration::from_millis(10), 2);
    assert!(obs.is_active());

    bus.unsubscribe(sid).await;
    drop(rx);
    let m = mset.clone();
    eventually("idle observable destroyed", || {
        let m = m.clone();
        async move { m.num_observables().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn ephemeral_reconnect_resumes_delivery() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("EP");
            c.subjects = vec!["foo.*".into()];
            c
        })
        .await
        .unwrap();

    let delivery = inbox();
    let (sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::default();
            c.delivery_subject = Some(delivery.clone());
            c.ack_policy = AckPolicy::Explicit;
            c
        })
        .await
        .unwrap();
    // High threshold so the ephemeral survives the reconnect windows.
    obs.set_active_check_params(Duration::from_millis(50), 100);

    let expect_seq = |m: &Delivery, want: u64, obs: &Arc<Observable>| {
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(want));
    };

    bus.publish("foo.22", None, Bytes::from_static(b"OK!"))
        .await
        .unwrap();
    let m = recv(&mut rx).await;
    expect_seq(&m, 1, &obs);
    ack(&bus, m.reply.as_deref().unwrap()).await;

    // Simulated reconnect on the same delivery subject.
    bus.unsubscribe(sid).await;
    drop(rx);
    let (sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    bus.publish("foo.22", None, Bytes::from_static(b"OK!"))
        .await
        .unwrap();
    let m = recv(&mut rx).await;
    expect_seq(&m, 2, &obs);
    ack(&bus, m.reply.as_deref().unwrap()).await;

    // Lose interest and queue up more messages; the delivery attempt
    // notices the missing listener right away.
    bus.unsubscribe(sid).await;
    drop(rx);
    for _ in 3..=10 {
        bus.publish("foo.22", None, Bytes::from_static(b"OK!"))
            .await
            .unwrap();
    }
    let o = obs.clone();
    eventually("observable inactive", || {
        let o = o.clone();
        async move { !o.is_active() }
    })
    .await;

    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    for want in 3..=10u64 {
        let m = recv(&mut rx).await;
        expect_seq(&m, want, &obs);
        ack(&bus, m.reply.as_deref().unwrap()).await;
    }
}

#[tokio::test]
async fn durable_reconnect_and_rebind() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("DT");
            c.subjects = vec!["foo.*".into()];
            c
        })
        .await
        .unwrap();

    let subj1 = inbox();
    let durable_cfg = |delivery: &str| {
        let mut c = ObservableConfig::push_all(delivery.to_string());
        c.durable = Some("d22".into());
        c.ack_policy = AckPolicy::Explicit;
        c
    };

    // Durables may be created before any listener exists.
    let obs = mset.add_observable(durable_cfg(&subj1)).await.unwrap();
    obs.set_active_check_params(Duration::from_millis(50), 2);

    for _ in 0..10 {
        publish_ok(&bus, "foo.22", b"OK!").await;
    }

    let (sid, mut rx) = bus.subscribe(&subj1).await.unwrap();
    let mut replies = Vec::new();
    for i in 1..=10u64 {
        let m = recv(&mut rx).await;
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
        replies.push(m.reply.unwrap());
    }
    for reply in &replies[..5] {
        ack(&bus, reply).await;
    }
    let o = obs.clone();
    eventually("first half acked", || {
        let o = o.clone();
        async move { o.info().await.num_pending == 5 }
    })
    .await;

    // Same durable while the first is still active collides.
    assert!(obs.is_active());
    let err = mset.add_observable(durable_cfg(&subj1)).await.unwrap_err();
    assert_eq!(err.kind(), strata_engine::ErrorKind::AlreadyExists);

    // Lose interest and wait out the activity check.
    bus.unsubscribe(sid).await;
    drop(rx);
    let o = obs.clone();
    eventually("durable inactive", || {
        let o = o.clone();
        async move { !o.is_active() }
    })
    .await;
    assert_eq!(mset.num_observables().await, 1, "durables are not expired");

    // Re-bind to a fresh delivery subject; the unacked half is
    // redelivered with fresh deliver sequences and bumped counts.
    let subj2 = inbox();
    let (_sid, mut rx) = bus.subscribe(&subj2).await.unwrap();
    let rebound = mset.add_observable(durable_cfg(&subj2)).await.unwrap();
    assert_eq!(rebound.name(), obs.name());

    for want_sseq in 6..=10u64 {
        let m = recv(&mut rx).await;
        let info = rebound.reply_info(m.reply.as_deref().unwrap()).unwrap();
        assert_eq!(info.store_seq, want_sseq);
        assert!(info.deliver_seq > 10);
        assert_eq!(info.deliver_count, 2);
        ack(&bus, m.reply.as_deref().unwrap()).await;
    }
    let o = rebound.clone();
    eventually("everything acked", || {
        let o = o.clone();
        async move { o.info().await.num_pending == 0 }
    })
    .await;
}

#[tokio::test]
async fn replay_original_paces_push_and_pull() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account.add_msg_set(MsgSetConfig::new("DC")).await.unwrap();

    // Record the real inter-arrival gaps.
    let mut gaps = Vec::new();
    let mut last = Instant::now();
    for i in 0..5u64 {
        gaps.push(last.elapsed());
        publish_ok(&bus, "DC", b"OK!").await;
        last = Instant::now();
        tokio::time::sleep(Duration::from_millis(20 + 10 * i)).await;
    }

    // Instant replay arrives in a burst.
    let delivery = inbox();
    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable(ObservableConfig::push_all(delivery))
        .await
        .unwrap();
    let start = Instant::now();
    for _ in 0..5 {
        recv(&mut rx).await;
    }
    assert!(start.elapsed() < Duration::from_millis(100));
    obs.delete().await.unwrap();

    // Original replay reproduces the recorded spacing.
    let delivery = inbox();
    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::push_all(delivery);
            c.replay = ReplayPolicy::Original;
            c
        })
        .await
        .unwrap();
    for gap in &gaps {
        let start = Instant::now();
        recv(&mut rx).await;
        let measured = start.elapsed();
        assert!(
            measured + Duration::from_millis(5) >= *gap,
            "delivery arrived early: {measured:?} vs gap {gap:?}"
        );
        assert!(
            measured <= *gap + Duration::from_millis(50),
            "delivery arrived late: {measured:?} vs gap {gap:?}"
        );
    }
    obs.delete().await.unwrap();

    // Pull mode paces the same way.
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::worker("PM");
            c.replay = ReplayPolicy::Original;
            c
        })
        .await
        .unwrap();
    for gap in &gaps {
        let start = Instant::now();
        let m = get_next(&bus, &obs).await;
        let measured = start.elapsed();
        assert!(measured + Duration::from_millis(5) >= *gap);
        assert!(measured <= *gap + Duration::from_millis(50));
        ack(&bus, m.reply.as_deref().unwrap()).await;
    }
}

#[tokio::test]
async fn replay_delete_terminates_promptly() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account.add_msg_set(MsgSetConfig::new("DC")).await.unwrap();

    publish_ok(&bus, "DC", b"OK!").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    publish_ok(&bus, "DC", b"OK!").await;

    let delivery = inbox();
    let (_sid, mut rx) = bus.subscribe(&delivery).await.unwrap();
    let obs = mset
        .add_observable({
            let mut c = ObservableConfig::push_all(delivery);
            c.replay = ReplayPolicy::Original;
            c
        })
        .await
        .unwrap();

    // First message arrives, the pacer then sleeps toward the second.
    recv(&mut rx).await;

    // Deletion must interrupt the pacing sleep, not wait it out.
    let start = Instant::now();
    timeout(Duration::from_millis(250), obs.delete())
        .await
        .expect("delete blocked on replay pacer")
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(mset.num_observables().await, 0);
}

#[tokio::test]
async fn durable_journal_recovers_on_restart() {
    let bus1 = MemoryBus::new();
    let server1 = Server::new(bus1.clone());
    let dir = tempfile::tempdir().expect("tempdir");
    server1
        .enable_jetstream(Some(EngineConfig {
            max_memory: 1 << 30,
            max_storage: 1 << 30,
            store_dir: dir.path().to_path_buf(),
        }))
        .await
        .unwrap();
    let account1 = server1.global_account().await;

    let file_config = || {
        let mut c = MsgSetConfig::new("JLOG");
        c.storage = StorageType::File;
        c
    };

    let mset = account1.add_msg_set(file_config()).await.unwrap();
    let obs = mset
        .add_observable(ObservableConfig::worker("W"))
        .await
        .unwrap();

    for _ in 0..5 {
        publish_ok(&bus1, "JLOG", b"persist").await;
    }
    for i in 1..=3u64 {
        let m = get_next(&bus1, &obs).await;
        assert_eq!(obs.seq_from_reply(m.reply.as_deref().unwrap()), Some(i));
        if i <= 2 {
            ack(&bus1, m.reply.as_deref().unwrap()).await;
        }
    }
    let o = obs.clone();
    eventually("acks settled", || {
        let o = o.clone();
        async move { o.info().await.num_pending == 1 }
    })
    .await;

    // A new server over the same store directory picks up the log and
    // the durable's journal.
    let bus2 = MemoryBus::new();
    let server2 = Server::new(bus2.clone());
    server2
        .enable_jetstream(Some(EngineConfig {
            max_memory: 1 << 30,
            max_storage: 1 << 30,
            store_dir: dir.path().to_path_buf(),
        }))
        .await
        .unwrap();
    let account2 = server2.global_account().await;
    let mset2 = account2.add_msg_set(file_config()).await.unwrap();
    assert_eq!(mset2.stats().await.msgs, 5);

    let obs2 = mset2
        .add_observable(ObservableConfig::worker("W"))
        .await
        .unwrap();

    // The unacked delivery comes back first, then the cursor resumes.
    let m = get_next(&bus2, &obs2).await;
    let info = obs2.reply_info(m.reply.as_deref().unwrap()).unwrap();
    assert_eq!(info.store_seq, 3);
    assert_eq!(info.deliver_count, 2);
    assert!(info.deliver_seq >= 4);
    ack(&bus2, m.reply.as_deref().unwrap()).await;

    let m = get_next(&bus2, &obs2).await;
    assert_eq!(
        obs2.reply_info(m.reply.as_deref().unwrap()).unwrap().store_seq,
        4
    );
}

#[tokio::test]
async fn msg_set_delete_removes_workers() {
    let (bus, _server, account, _dir) = setup().await;
    let mset = account
        .add_msg_set({
            let mut c = MsgSetConfig::new("TEARDOWN");
            c.subjects = vec!["foo.*".into()];
            c
        })
        .await
        .unwrap();

    let delivery = inbox();
    let (_sid, _rx) = bus.subscribe(&delivery).await.unwrap();
    mset.add_observable(ObservableConfig::push_all(delivery))
        .await
        .unwrap();
    mset.add_observable(ObservableConfig::worker("W1"))
        .await
        .unwrap();
    publish_ok(&bus, "foo.1", b"x").await;

    timeout(Duration::from_secs(5), mset.delete())
        .await
        .expect("delete hung on workers")
        .unwrap();
    assert!(account.lookup_msg_set("TEARDOWN").await.is_none());
}
