/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end tests: a server, producers and consumers talking over the
//! in-process fabric.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::config::TransportConfig;
use crate::consumer::Consumer;
use crate::error::FaultSlot;
use crate::error::TransportError;
use crate::event_loop;
use crate::event_loop::EventLoop;
use crate::fabric::CmEventKind;
use crate::fabric::Fabric;
use crate::fabric::local::LocalFabric;
use crate::logging::initialize_logging_for_test;
use crate::message::Record;
use crate::producer::Producer;
use crate::server::Server;
use crate::test_utils::RecordingHooks;
use crate::test_utils::test_config;

const WAIT: Duration = Duration::from_secs(10);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

struct Fixture {
    fabric: Arc<dyn Fabric>,
    server: Server,
    address: String,
}

fn start(config: TransportConfig) -> Result<Fixture, TransportError> {
    initialize_logging_for_test();
    let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
    let server = Server::start(fabric.clone(), config)?;
    let address = format!("127.0.0.1:{}", server.local_addr().port());
    Ok(Fixture {
        fabric,
        server,
        address,
    })
}

fn sealing_config() -> TransportConfig {
    TransportConfig {
        seal_log_on_producer_exit: true,
        ..test_config()
    }
}

fn drain(consumer: &Consumer) -> Result<Vec<Record>, TransportError> {
    let mut records = Vec::new();
    while let Some(record) = consumer.consume_record()? {
        records.push(record);
    }
    Ok(records)
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_relay_two_records() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(sealing_config())?;

    let producer = Producer::init(fabric.clone(), test_config(), &address)?;
    producer.produce_record("Arjun", "Kingfisher")?;
    producer.produce_record("Danish", "Corona")?;
    producer.terminate()?;

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    let first = consumer.consume_record()?.unwrap();
    assert_eq!(first.key(), b"Arjun");
    assert_eq!(first.value(), b"Kingfisher");
    let second = consumer.consume_record()?.unwrap();
    assert_eq!(second.key(), b"Danish");
    assert_eq!(second.value(), b"Corona");
    // The log was sealed when the producer finished.
    assert!(consumer.consume_record()?.is_none());
    assert!(consumer.consume_record()?.is_none());
    consumer.terminate()?;

    assert!(wait_until(|| server.consumer_count() == 0));
    assert_eq!(server.producer_count(), 0);
    server.shutdown()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_fifo_with_concurrent_consumer() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(sealing_config())?;

    let mut rng = rand::thread_rng();
    let mut word = |max: usize| -> String {
        let len = rng.gen_range(1..=max);
        (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    };
    let expected: Vec<(String, String)> = (0..300).map(|_| (word(16), word(64))).collect();

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    assert!(consumer.wait_connected(WAIT)?);
    let reader = std::thread::spawn(move || -> Result<Vec<Record>, TransportError> {
        let records = drain(&consumer)?;
        consumer.terminate()?;
        Ok(records)
    });

    let producer = Producer::init(fabric.clone(), test_config(), &address)?;
    for (key, value) in &expected {
        producer.produce_record(key.as_str(), value.as_str())?;
    }
    producer.terminate()?;

    let received = reader.join().unwrap()?;
    let received: Vec<(String, String)> = received
        .into_iter()
        .map(|record| {
            let (key, value) = record.into_parts();
            (
                String::from_utf8(key).unwrap(),
                String::from_utf8(value).unwrap(),
            )
        })
        .collect();
    assert_eq!(received, expected);

    let log = server.shared_log().unwrap();
    assert_eq!(log.record_count(), 300);
    assert!(log.is_sealed());
    drop(log);
    server.shutdown()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_empty_stream_ends_cleanly() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(sealing_config())?;

    let producer = Producer::init(fabric.clone(), test_config(), &address)?;
    assert!(producer.wait_connected(WAIT)?);
    assert!(wait_until(|| server.producer_count() == 1));
    producer.terminate()?;
    assert!(wait_until(|| server
        .shared_log()
        .is_some_and(|log| log.is_sealed())));
    assert_eq!(server.producer_count(), 0);

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    assert!(consumer.consume_record()?.is_none());
    consumer.terminate()?;

    assert!(matches!(
        server.publish("late", "record"),
        Err(TransportError::LogSealed)
    ));
    server.shutdown()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_consumers_share_one_registration() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(test_config())?;

    // Published before any consumer exists.
    server.publish("local", "first")?;
    assert_eq!(server.log_registrations(), 0);

    let consumers = (0..2)
        .map(|_| Consumer::init(fabric.clone(), test_config(), &address))
        .collect::<Result<Vec<_>, _>>()?;
    for consumer in &consumers {
        assert!(consumer.wait_connected(WAIT)?);
    }
    assert!(wait_until(|| server.consumer_count() == 2));
    assert_eq!(server.log_registrations(), 1);

    server.publish("local", "second")?;
    for consumer in &consumers {
        assert_eq!(consumer.consume_record()?.unwrap().to_string(), "local/first");
        assert_eq!(consumer.consume_record()?.unwrap().to_string(), "local/second");
    }

    // Consumers stop while polling an unwritten prefix.
    for consumer in consumers {
        consumer.terminate()?;
    }
    assert!(wait_until(|| server.consumer_count() == 0));
    assert_eq!(server.log_registrations(), 1);
    server.shutdown()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_backlog_overflow() -> Result<(), anyhow::Error> {
    initialize_logging_for_test();
    let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());

    // A listener nobody serves: the connect request is never accepted, so
    // nothing drains the backlog.
    let channel = fabric.create_event_channel()?;
    let listener = fabric.create_id(channel)?;
    fabric.bind_addr(listener, "127.0.0.1:0".parse()?)?;
    fabric.listen(listener, 1)?;
    let address = fabric.local_addr(listener)?.to_string();

    let config = TransportConfig {
        backlog_capacity: 3,
        ..test_config()
    };
    let producer = Producer::init(fabric.clone(), config, &address)?;
    producer.produce_record("a", "1")?;
    producer.produce_record("b", "2")?;
    producer.produce_record("c", "3")?;
    assert!(matches!(
        producer.produce_record("d", "4"),
        Err(TransportError::BacklogOverflow { capacity: 3 })
    ));
    assert_eq!(producer.backlog_len(), 3);

    let request = fabric.get_cm_event(channel, WAIT)?.unwrap();
    assert_eq!(request.kind, CmEventKind::ConnectRequest);
    // Abandoning the request rejects the producer, which faults instead of
    // waiting for an accept that never comes.
    fabric.destroy_id(request.id)?;
    match producer.terminate() {
        Err(TransportError::Faulted(message)) => {
            assert!(message.contains("Rejected"), "{}", message)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    fabric.destroy_id(listener)?;
    fabric.destroy_event_channel(channel)?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_listener_teardown_rejects_pending_consumer() -> Result<(), anyhow::Error> {
    initialize_logging_for_test();
    let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
    let hooks = Arc::new(RecordingHooks::default());
    // Listening, but nothing handles the listener's events yet.
    let event_loop =
        EventLoop::listen(fabric.clone(), test_config(), hooks, FaultSlot::new(false))?;
    let address = event_loop.local_addr().unwrap().to_string();

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    assert!(!consumer.wait_connected(Duration::from_millis(200))?);
    // Stops before handling the queued connect request.
    let stop = Arc::new(AtomicBool::new(true));
    event_loop::spawn_server(event_loop, stop)?.join().unwrap();

    assert!(matches!(
        consumer.consume_record(),
        Err(TransportError::Faulted(_))
    ));
    assert!(matches!(consumer.terminate(), Err(TransportError::Faulted(_))));
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_server_shutdown_ends_consumer_stream() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(test_config())?;
    server.publish("a", "1")?;
    server.publish("b", "2")?;

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    assert!(consumer.wait_connected(WAIT)?);
    // Long enough for the first record to be waiting in the handoff.
    std::thread::sleep(Duration::from_millis(300));
    server.shutdown()?;

    // Already handed over, so still delivered; nothing is read after it.
    assert_eq!(consumer.consume_record()?.unwrap().to_string(), "a/1");
    assert!(consumer.consume_record()?.is_none());
    assert!(consumer.consume_record()?.is_none());
    consumer.terminate()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_publish_refuses_what_the_log_cannot_hold() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(TransportConfig {
        log_capacity: 4096,
        ..test_config()
    })?;

    // Published before any consumer, so nothing is registered yet.
    let value = vec![b'v'; 1000];
    let mut admitted = 0;
    let refused = loop {
        match server.publish("k", value.clone()) {
            Ok(()) => admitted += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(refused, TransportError::LogFull { .. }), "{:?}", refused);
    assert!(admitted > 0);
    assert_eq!(server.log_registrations(), 0);

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    for _ in 0..admitted {
        let record = consumer.consume_record()?.unwrap();
        assert_eq!(record.key(), b"k");
        assert_eq!(record.value(), value.as_slice());
    }
    assert_eq!(server.log_registrations(), 1);
    server.check()?;
    assert!(matches!(
        server.publish("k", value.clone()),
        Err(TransportError::LogFull { .. })
    ));

    consumer.terminate()?;
    server.shutdown()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_invalid_records_are_refused() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(sealing_config())?;

    let producer = Producer::init(fabric.clone(), test_config(), &address)?;
    assert!(matches!(
        producer.produce_record("a/b", "c"),
        Err(TransportError::InvalidRecord(_))
    ));
    assert!(matches!(
        producer.produce_record("k", vec![b'v'; 10_000]),
        Err(TransportError::RecordTooLarge { .. })
    ));
    assert_eq!(producer.backlog_len(), 0);
    producer.produce_record("k", vec![b'v'; 9_997])?;
    producer.terminate()?;

    let consumer = Consumer::init(fabric.clone(), test_config(), &address)?;
    let record = consumer.consume_record()?.unwrap();
    assert_eq!(record.value().len(), 9_997);
    assert!(consumer.consume_record()?.is_none());
    consumer.terminate()?;
    server.shutdown()?;
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_unreachable_server_faults() -> Result<(), anyhow::Error> {
    initialize_logging_for_test();
    let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());

    let producer = Producer::init(fabric.clone(), test_config(), "127.0.0.1:1")?;
    match producer.wait_connected(WAIT) {
        Err(TransportError::Faulted(message)) => {
            assert!(message.contains("Rejected"), "{}", message)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(matches!(
        producer.produce_record("k", "v"),
        Err(TransportError::Faulted(_))
    ));
    assert!(matches!(producer.terminate(), Err(TransportError::Faulted(_))));

    let consumer = Consumer::init(fabric.clone(), test_config(), "127.0.0.1:1")?;
    assert!(matches!(
        consumer.consume_record(),
        Err(TransportError::Faulted(_))
    ));
    assert!(matches!(consumer.terminate(), Err(TransportError::Faulted(_))));
    Ok(())
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_server_shutdown_faults_idle_producer() -> Result<(), anyhow::Error> {
    let Fixture {
        fabric,
        server,
        address,
    } = start(test_config())?;

    let producer = Producer::init(fabric.clone(), test_config(), &address)?;
    producer.produce_record("k", "v")?;
    assert!(wait_until(|| server
        .shared_log()
        .is_some_and(|log| log.record_count() == 1)));

    server.shutdown()?;
    // The record was relayed, but the stream never ended.
    assert!(wait_until(|| producer.wait_connected(Duration::ZERO).is_err()));
    assert!(matches!(
        producer.produce_record("k", "v"),
        Err(TransportError::Faulted(_))
    ));
    assert!(matches!(producer.terminate(), Err(TransportError::Faulted(_))));
    Ok(())
}
