mod support;

use ez_live_player::error::{ConfigurationError, Error};
use ez_live_player::{
    owner_context, LivePlayer, OverflowPolicy, OwnerContext, Packet, PacketQueue, PlayerConfig,
    PlayerEvent, PlayerStatus, StreamKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use support::*;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> PlayerConfig {
    PlayerConfig::default()
        .set_reconnect_delay_ms(0)
        .set_stats_interval(Duration::from_millis(20))
        .set_empty_queue_backoff(Duration::from_millis(1))
        .set_pacer_interval(Duration::from_millis(2))
}

#[test]
fn test_retries_exhaust_then_stop() {
    init_logger();
    let player = LivePlayer::new(fast_config().set_max_reconnect_attempts(3), MockBackend::failing())
        .unwrap();
    let events = player.events();
    player.start("rtsp://192.0.2.1/live").unwrap();

    let collected = collect_until(&events, WAIT, is_stopped);
    assert_eq!(
        statuses(&collected),
        vec![
            PlayerStatus::Connecting,
            PlayerStatus::Retrying { attempt: 1, max_attempts: 3 },
            PlayerStatus::Retrying { attempt: 2, max_attempts: 3 },
            PlayerStatus::Retrying { attempt: 3, max_attempts: 3 },
            PlayerStatus::Error,
            PlayerStatus::Stopped,
        ]
    );
    assert!(collected.iter().any(|event| matches!(
        event,
        PlayerEvent::ErrorOccurred { message, fatal: true }
            if message == "Failed to connect after 3 attempts."
    )));
    assert!(!player.is_running());
    assert_eq!(player.active_workers(), 0);
}

#[test]
fn test_drop_oldest_keeps_newest() {
    let live = AtomicBool::new(true);
    let queue = PacketQueue::new(StreamKind::Video, 90, OverflowPolicy::DropOldest);
    for i in 0..130u32 {
        assert!(queue.push(Packet::new(0, i.to_le_bytes().to_vec()), &live));
    }
    assert_eq!(queue.len(), 90);
    assert_eq!(queue.dropped_count(), 40);
    let first = queue.pop(&live).unwrap();
    assert_eq!(first.data().as_ref(), &40u32.to_le_bytes());
}

#[test]
fn test_concurrent_stop_is_single_flight() {
    init_logger();
    // The owner never pumps, so device teardown holds the flight open until
    // its timeout and every concurrent request joins the same one.
    let (dispatcher, _owner) = owner_context();
    let player = Arc::new(
        LivePlayer::builder(MockBackend::new(Script {
            video_packets: 3,
            ..Script::default()
        }))
        .config(fast_config())
        .dispatcher(dispatcher)
        .build()
        .unwrap(),
    );
    let events = player.events();
    player.start("rtmp://127.0.0.1/live/cam").unwrap();
    collect_until(&events, WAIT, |event| {
        matches!(event, PlayerEvent::StatusChanged(PlayerStatus::Playing))
    });

    let barrier = Arc::new(Barrier::new(4));
    let tickets: Vec<_> = (0..4)
        .map(|_| {
            let player = player.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                player.request_stop()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for ticket in &tickets {
        assert!(ticket.same_flight(&tickets[0]));
        assert!(ticket.wait_timeout(WAIT));
    }
    let stops = collect_until(&events, Duration::from_millis(200), |_| false)
        .iter()
        .filter(|event| is_stopped(event))
        .count();
    assert_eq!(stops, 1);
    assert!(!player.is_running());
    assert_eq!(player.active_workers(), 0);
}

/// Player whose teardown waits on an owner context nobody pumps.
fn unpumped_owner_player(script: Script) -> (Arc<LivePlayer>, OwnerContext, CaptureSink) {
    let (dispatcher, owner) = owner_context();
    let sink = CaptureSink::default();
    let player = LivePlayer::builder(MockBackend::new(script))
        .config(fast_config())
        .dispatcher(dispatcher)
        .audio_sink(sink.clone())
        .build()
        .unwrap();
    (Arc::new(player), owner, sink)
}

#[test]
fn test_concurrent_blocking_stops_share_one_sequence() {
    init_logger();
    let (player, _owner, _sink) = unpumped_owner_player(Script {
        video_packets: 3,
        ..Script::default()
    });
    let events = player.events();
    player.start("rtsp://127.0.0.1/live/many").unwrap();
    collect_until(&events, WAIT, |event| {
        matches!(event, PlayerEvent::StatusChanged(PlayerStatus::Playing))
    });

    let barrier = Arc::new(Barrier::new(4));
    let callers: Vec<_> = (0..4)
        .map(|_| {
            let player = player.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                player.stop();
                player.is_running()
            })
        })
        .collect();
    for caller in callers {
        assert!(!caller.join().unwrap());
    }

    let stops = collect_until(&events, Duration::from_millis(200), |_| false)
        .iter()
        .filter(|event| is_stopped(event))
        .count();
    assert_eq!(stops, 1);
    assert_eq!(player.active_workers(), 0);
}

#[test]
fn test_owner_stop_joins_flight_without_blocking() {
    init_logger();
    let (player, owner, sink) = unpumped_owner_player(Script {
        video_packets: 2,
        audio_packets: 2,
        audio: Some(ez_live_player::AudioFormat::new(48000, 2)),
        ..Script::default()
    });
    let events = player.events();
    owner.start(&player, "rtmp://127.0.0.1/live/owner").unwrap();
    let deadline = Instant::now() + WAIT;
    while sink.opens.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        owner.run_for(Duration::from_millis(10));
    }
    assert_eq!(sink.opens.load(Ordering::SeqCst), 1);

    // teardown now waits for this thread to pump
    let in_flight = player.request_stop();
    let started = Instant::now();
    let ticket = owner.stop(&player);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(ticket.same_flight(&in_flight));
    assert!(!ticket.is_done());

    let deadline = Instant::now() + WAIT;
    while !ticket.is_done() && Instant::now() < deadline {
        owner.run_for(Duration::from_millis(10));
    }
    assert!(ticket.is_done());
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    let owner_name = std::thread::current().name().unwrap_or("").to_string();
    assert_eq!(sink.threads.lock().unwrap().last(), Some(&owner_name));
    assert_eq!(
        events.try_iter().filter(|event| is_stopped(event)).count(),
        1
    );
}

#[test]
fn test_plain_stop_on_owner_thread_does_not_stall() {
    init_logger();
    let (player, owner, sink) = unpumped_owner_player(Script {
        video_packets: 1,
        audio_packets: 1,
        audio: Some(ez_live_player::AudioFormat::new(44100, 1)),
        ..Script::default()
    });
    owner.start(&player, "srt://127.0.0.1:9001").unwrap();
    let deadline = Instant::now() + WAIT;
    while sink.opens.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        owner.run_for(Duration::from_millis(10));
    }

    let started = Instant::now();
    player.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    assert_eq!(owner.run_pending(), 0);
}

#[test]
fn test_stop_during_slow_open_never_plays() {
    init_logger();
    let player = LivePlayer::new(
        fast_config(),
        MockBackend::new(Script {
            video_packets: 3,
            open_delay: Duration::from_millis(200),
            ..Script::default()
        }),
    )
    .unwrap();
    let events = player.events();
    player.start("rtmp://127.0.0.1/live/slow").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    player.stop();

    let collected = collect_until(&events, Duration::from_millis(200), |_| false);
    assert_eq!(
        statuses(&collected),
        vec![PlayerStatus::Connecting, PlayerStatus::Stopped]
    );
    assert!(!collected
        .iter()
        .any(|event| matches!(event, PlayerEvent::FrameReady(_))));
    assert_eq!(player.active_workers(), 0);
}

#[test]
fn test_empty_address_is_rejected() {
    let player = LivePlayer::new(fast_config(), MockBackend::default()).unwrap();
    let events = player.events();

    let result = player.start("   ");
    assert!(matches!(
        result,
        Err(Error::Configuration(ConfigurationError::EmptyAddress))
    ));
    assert!(!player.is_running());
    assert_eq!(player.active_workers(), 0);
    match events.try_recv().unwrap() {
        PlayerEvent::ErrorOccurred { message, fatal } => {
            assert_eq!(message, "Stream URL is empty.");
            assert!(fatal);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_frames_reach_consumer() {
    init_logger();
    let player = LivePlayer::new(
        fast_config(),
        MockBackend::new(Script {
            video_packets: 5,
            ..Script::default()
        }),
    )
    .unwrap();
    let events = player.events();
    player.start("srt://127.0.0.1:9000").unwrap();

    let mut frames = 0;
    collect_until(&events, WAIT, |event| {
        if let PlayerEvent::FrameReady(frame) = event {
            assert_eq!((frame.width(), frame.height()), (2, 2));
            frames += 1;
        }
        frames == 5
    });
    assert_eq!(frames, 5);

    player.stop();
    assert!(!player.is_running());
    assert_eq!(player.stats().video_queue_size, 0);
}

#[test]
fn test_audio_is_paced_into_sink() {
    init_logger();
    let sink = CaptureSink::default();
    let player = LivePlayer::builder(MockBackend::new(Script {
        video_packets: 3,
        audio_packets: 3,
        audio: Some(ez_live_player::AudioFormat::new(44100, 2)),
        ..Script::default()
    }))
    .config(fast_config())
    .audio_sink(sink.clone())
    .build()
    .unwrap();
    player.start("http://127.0.0.1/live.flv").unwrap();

    let deadline = Instant::now() + WAIT;
    while sink.written.lock().unwrap().len() < 12 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        sink.written.lock().unwrap().as_slice(),
        &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]
    );

    player.stop();
    assert_eq!(sink.opens.load(Ordering::SeqCst), 1);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_owner_context_runs_device_work() {
    init_logger();
    let (dispatcher, owner) = owner_context();
    let sink = CaptureSink::default();
    let player = LivePlayer::builder(MockBackend::new(Script {
        video_packets: 1,
        audio_packets: 1,
        audio: Some(ez_live_player::AudioFormat::new(48000, 1)),
        ..Script::default()
    }))
    .config(fast_config())
    .dispatcher(dispatcher)
    .audio_sink(sink.clone())
    .build()
    .unwrap();
    let events = player.events();

    owner.start(&player, "rtsp://127.0.0.1/owner").unwrap();
    let deadline = Instant::now() + WAIT;
    while sink.opens.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        owner.run_for(Duration::from_millis(10));
    }

    let ticket = owner.stop(&player);
    assert!(ticket.is_done());
    assert!(events.try_iter().any(|event| is_stopped(&event)));

    let owner_name = std::thread::current().name().unwrap_or("").to_string();
    let threads = sink.threads.lock().unwrap().clone();
    assert_eq!(threads, vec![owner_name.clone(), owner_name]);
}

#[cfg(feature = "async")]
#[tokio::test]
async fn test_stop_ticket_is_awaitable() {
    let player = LivePlayer::new(fast_config(), MockBackend::failing()).unwrap();
    player.start("rtmp://127.0.0.1/live/a").unwrap();
    let ticket = player.request_stop();
    tokio::time::timeout(WAIT, ticket.clone()).await.unwrap();
    assert!(ticket.is_done());
    assert!(!player.is_running());
}
