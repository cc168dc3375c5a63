use std::cmp::Ordering;
use std::thread;
use std::time::Duration;

use join_core::backend::memory::InMemoryBroker;
use join_core::{
    BrokerSettings, JoinEngine, MessageBroker, Position, Record, StreamError, TopicMap,
};
use serde_json::json;

join_core::stream_types! {
    enum Side {
        A => ("A", "props.a"),
        B => ("B", "props.b"),
    }
}

const GROUP: &str = "props";

fn settings() -> BrokerSettings {
    BrokerSettings::new(GROUP, Duration::from_millis(80)).with_poll_timeout(Duration::from_millis(5))
}

fn engine(backend: &InMemoryBroker) -> JoinEngine<Side, InMemoryBroker> {
    JoinEngine::new(MessageBroker::new(
        backend.clone(),
        TopicMap::new().unwrap(),
        settings(),
    ))
}

fn publish(backend: &InMemoryBroker, stream: Side, records: &[Record]) {
    let topic = TopicMap::<Side>::new().unwrap().topic(stream).to_string();
    for record in records {
        backend
            .publish_raw(&topic, serde_json::to_vec(record).unwrap())
            .unwrap();
    }
}

fn keyed(k: i64) -> Record {
    Record::new().with("k", k)
}

fn key_of(record: &Record) -> i64 {
    record.get("k").and_then(|v| v.as_i64()).unwrap()
}

fn referencing(k: i64) -> impl FnMut(&Record) -> Ordering {
    move |candidate| key_of(candidate).cmp(&k)
}

#[test]
fn test_step_back_replays_same_record_and_holds_commit() {
    let backend = InMemoryBroker::new();
    publish(&backend, Side::A, &[keyed(1), keyed(2)]);
    let mut engine = engine(&backend);
    let broker = engine.broker_mut();

    let first = broker.next(Side::A).unwrap();
    broker.step_back(Side::A).unwrap();
    broker.commit(None).unwrap();
    assert_eq!(backend.committed_offset(GROUP, "props.a"), Some(Position::new(0)));

    let again = broker.next(Side::A).unwrap();
    assert_eq!(first, again);
    assert_eq!(key_of(&broker.next(Side::A).unwrap()), 2);
}

#[test]
fn test_second_step_back_is_rejected_and_keeps_buffer() {
    let backend = InMemoryBroker::new();
    publish(&backend, Side::A, &[keyed(1), keyed(2)]);
    let mut engine = engine(&backend);
    let broker = engine.broker_mut();

    broker.next(Side::A).unwrap();
    broker.step_back(Side::A).unwrap();
    assert!(matches!(
        broker.step_back(Side::A),
        Err(StreamError::AlreadySteppedBack { stream: "A" })
    ));

    assert_eq!(key_of(&broker.next(Side::A).unwrap()), 1);
    assert_eq!(key_of(&broker.next(Side::A).unwrap()), 2);
}

#[test]
fn test_restart_resumes_from_committed_data_key() {
    let backend = InMemoryBroker::new();
    publish(&backend, Side::A, &[keyed(1), keyed(2), keyed(3)]);
    publish(&backend, Side::B, &[keyed(1), keyed(2)]);

    {
        let mut engine = engine(&backend);
        let broker = engine.broker_mut();
        broker.next(Side::A).unwrap();
        broker.next(Side::A).unwrap();
        broker.next(Side::B).unwrap();
        let data_key = broker.get_data_key();

        // Read past the snapshot without committing, then "crash".
        broker.next(Side::A).unwrap();
        broker.next(Side::B).unwrap();
        broker.commit(Some(data_key)).unwrap();
    }

    let mut engine = engine(&backend);
    let broker = engine.broker_mut();
    assert_eq!(key_of(&broker.next(Side::A).unwrap()), 3);
    assert_eq!(key_of(&broker.next(Side::B).unwrap()), 2);
}

#[test]
fn test_equal_keys_join_once_per_cycle() {
    let backend = InMemoryBroker::new();
    publish(
        &backend,
        Side::A,
        &[keyed(1).with("v", "a1"), keyed(2).with("v", "a2")],
    );
    publish(
        &backend,
        Side::B,
        &[keyed(1).with("v", "b1"), keyed(2).with("v", "b2")],
    );
    let mut engine = engine(&backend);

    let mut pairs = Vec::new();
    for _ in 0..2 {
        let left = engine.get_elements(Side::A).next().unwrap().unwrap();
        let joined: Vec<Record> = engine
            .get_joined_elements(Side::B, referencing(key_of(&left)))
            .map_while(Result::ok)
            .collect();
        for right in joined {
            pairs.push((left.get("v").cloned(), right.get("v").cloned()));
        }
    }

    assert_eq!(
        pairs,
        vec![
            (Some(json!("a1")), Some(json!("b1"))),
            (Some(json!("a2")), Some(json!("b2"))),
        ]
    );
}

#[test]
fn test_ahead_record_is_replayed_once_partner_catches_up() {
    let backend = InMemoryBroker::new();
    publish(&backend, Side::A, &[keyed(5)]);
    publish(&backend, Side::B, &[keyed(3), keyed(5)]);
    let mut engine = engine(&backend);

    let b = engine.broker_mut().next(Side::B).unwrap();
    let ahead: Vec<_> = engine
        .get_joined_elements(Side::A, referencing(key_of(&b)))
        .collect();
    assert_eq!(ahead.len(), 1);
    assert!(matches!(ahead[0], Err(StreamError::RanAhead { stream: "A" })));

    let b = engine.broker_mut().next(Side::B).unwrap();
    assert_eq!(key_of(&b), 5);
    let caught_up = engine
        .get_joined_elements(Side::A, referencing(key_of(&b)))
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(caught_up, keyed(5));
    assert_eq!(engine.broker().position(Side::A), Some(Position::new(1)));
}

#[test]
fn test_behind_record_is_skipped_before_match() {
    let backend = InMemoryBroker::new();
    publish(&backend, Side::A, &[keyed(5)]);
    publish(&backend, Side::B, &[keyed(3), keyed(5)]);
    let mut engine = engine(&backend);

    let a = engine.broker_mut().next(Side::A).unwrap();
    let matched = engine
        .get_joined_elements(Side::B, referencing(key_of(&a)))
        .next()
        .unwrap()
        .unwrap();

    assert_eq!(key_of(&matched), 5);
    assert_eq!(engine.metrics().records_skipped, 1);
}

#[test]
fn test_sentinel_ends_stream_without_decode_error() {
    let backend = InMemoryBroker::new();
    let mut engine = engine(&backend);
    engine.send_eos(Side::A).unwrap();
    engine.flush().unwrap();

    let items: Vec<_> = engine.get_elements(Side::A).collect();
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(StreamError::EndOfStream { stream: "A" })));
}

#[test]
fn test_silence_times_out_before_it_ends_the_stream() {
    let backend = InMemoryBroker::new();
    let mut engine = engine(&backend);
    let broker = engine.broker_mut();

    assert!(matches!(
        broker.next(Side::B),
        Err(StreamError::Timeout { stream: "B" })
    ));
    thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        broker.next(Side::B),
        Err(StreamError::EndOfStream { stream: "B" })
    ));
}

#[test]
fn test_data_resets_silence_timer() {
    let backend = InMemoryBroker::new();
    let mut engine = engine(&backend);

    assert!(matches!(
        engine.broker_mut().next(Side::B),
        Err(StreamError::Timeout { .. })
    ));
    thread::sleep(Duration::from_millis(100));
    publish(&backend, Side::B, &[keyed(1)]);
    assert_eq!(key_of(&engine.broker_mut().next(Side::B).unwrap()), 1);

    assert!(matches!(
        engine.broker_mut().next(Side::B),
        Err(StreamError::Timeout { .. })
    ));
}

#[test]
fn test_undecodable_message_is_reported_and_passed() {
    let backend = InMemoryBroker::new();
    backend.publish_raw("props.a", b"not json".to_vec()).unwrap();
    publish(&backend, Side::A, &[keyed(1)]);
    let mut engine = engine(&backend);

    assert!(matches!(
        engine.broker_mut().next(Side::A),
        Err(StreamError::Decode { stream: "A", offset: 0, .. })
    ));
    assert_eq!(key_of(&engine.broker_mut().next(Side::A).unwrap()), 1);
}
