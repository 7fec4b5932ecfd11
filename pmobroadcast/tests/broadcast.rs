//! Tests d'intégration de la session de diffusion
//!
//! Le processeur externe est remplacé par [`common::FakeProcessor`] : la
//! sonde renvoie un débit scripté et le mixeur recopie son entrée.

mod common;

use std::{sync::Arc, time::Duration};

use common::{
    collect_for, discontinuities, effect_file, pattern, session_with, source_file, FakeProcessor,
};
use pmobroadcast::{BroadcastSettings, BroadcastSession, Error, Phase, PipelineEnd, SinkEvent};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test]
async fn test_listener_receives_at_probed_rate() {
    // 64 kbit/s -> 8000 octets/s
    let source = source_file(40_000);
    let session = session_with(source.path(), Arc::new(FakeProcessor::with_bitrate("64k")));

    let (_, listener) = session.register_listener();
    let collector = collect_for(listener, Duration::from_secs(2));
    session.start().await.unwrap();

    let received = collector.await.unwrap();
    session.stop().await;

    assert_eq!(session.bitrate().await, Some(64_000));
    assert!(received.bytes.len() > 10_000, "received {}", received.bytes.len());
    assert!(received.bytes.len() < 20_000, "received {}", received.bytes.len());
    assert_eq!(received.bytes, pattern(received.bytes.len()));
}

#[tokio::test]
async fn test_all_listeners_get_the_same_bytes() {
    let source = source_file(20_000);
    let session = session_with(source.path(), Arc::new(FakeProcessor::with_bitrate("1M")));

    let (_, first) = session.register_listener();
    let (_, second) = session.register_listener();
    let first = collect_for(first, Duration::from_millis(600));
    let second = collect_for(second, Duration::from_millis(600));

    let handle = session.start().await.unwrap();
    assert_eq!(handle.wait().await, PipelineEnd::Exhausted);

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.bytes, pattern(20_000));
    assert_eq!(second.bytes, first.bytes);

    // Les auditeurs restent connectés après la fin du run
    assert_eq!(session.registry().len(), 2);
}

#[tokio::test]
async fn test_late_listener_joins_live() {
    let source = source_file(60_000);
    let session = session_with(source.path(), Arc::new(FakeProcessor::with_bitrate("128k")));

    let (_, early) = session.register_listener();
    let early = collect_for(early, Duration::from_millis(900));
    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let (_, late) = session.register_listener();
    let late = collect_for(late, Duration::from_millis(400)).await.unwrap();
    session.stop().await;
    let early = early.await.unwrap();

    assert!(!late.bytes.is_empty());
    assert!(late.bytes.len() < early.bytes.len());

    // Pas de rejeu : l'auditeur tardif reçoit une tranche contiguë du flux
    assert_ne!(late.bytes[..1_600], pattern(1_600)[..]);
    assert!(late
        .bytes
        .windows(2)
        .all(|w| w[1] == ((w[0] as usize + 1) % 251) as u8));
}

#[tokio::test]
async fn test_injection_keeps_stream_continuous() {
    // 128 kbit/s -> 16000 octets/s, chunks de 1600 octets
    let source = source_file(80_000);
    let processor = Arc::new(FakeProcessor::with_bitrate("128k"));
    let session = session_with(source.path(), processor.clone());
    let mut events = session.sink().subscribe_events();

    let (_, listener) = session.register_listener();
    let collector = collect_for(listener, Duration::from_millis(1500));
    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let before = session.phase().await;
    let effect = effect_file();
    session.inject_effect(effect.path()).await.unwrap();
    let after = session.phase().await;

    let received = collector.await.unwrap();

    // Le sink n'est jamais resté sans producteur pendant l'injection
    let mut producers = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SinkEvent::ProducerAttached { producers: n })
            | Ok(SinkEvent::ProducerDetached { producers: n }) => producers.push(n),
            Ok(SinkEvent::ListenerPruned { .. }) => {}
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    session.stop().await;

    assert_eq!(producers, vec![1, 2, 1]);
    assert_eq!(processor.mixed_count(), 1);
    assert!(matches!(before, Phase::Playing { .. }));
    assert!(matches!(after, Phase::Playing { .. }));
    assert_ne!(before, after);

    // Aucun octet perdu ni dupliqué, pas de silence perceptible
    assert_eq!(received.bytes, pattern(received.bytes.len()));
    assert!(
        received.longest_gap() < Duration::from_millis(200),
        "gap of {:?}",
        received.longest_gap()
    );
}

#[tokio::test]
async fn test_concurrent_injection_is_rejected() {
    let source = source_file(80_000);
    let processor =
        Arc::new(FakeProcessor::with_bitrate("128k").mixer_delay(Duration::from_millis(300)));
    let session = session_with(source.path(), processor.clone());
    let (_, listener) = session.register_listener();
    let _collector = collect_for(listener, Duration::from_secs(1));

    session.start().await.unwrap();
    let effect = effect_file();

    let first = {
        let session = session.clone();
        let path = effect.path().to_path_buf();
        tokio::spawn(async move { session.inject_effect(path).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(session.phase().await, Phase::Splicing { .. }));

    let second = session.inject_effect(effect.path()).await;
    assert!(matches!(second, Err(Error::SpliceInProgress)));

    first.await.unwrap().unwrap();
    assert!(matches!(session.phase().await, Phase::Playing { .. }));
    assert_eq!(processor.mixed_count(), 1);
    session.stop().await;
}

#[tokio::test]
async fn test_stop_during_injection_abandons_the_splice() {
    let source = source_file(80_000);
    let processor =
        Arc::new(FakeProcessor::with_bitrate("128k").mixer_delay(Duration::from_millis(300)));
    let session = session_with(source.path(), processor);
    let handle = session.start().await.unwrap();
    let effect = effect_file();

    let injection = {
        let session = session.clone();
        let path = effect.path().to_path_buf();
        tokio::spawn(async move { session.inject_effect(path).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop().await;

    assert!(matches!(injection.await.unwrap(), Err(Error::NotPlaying)));
    assert_eq!(session.phase().await, Phase::Stopped);
    assert_eq!(session.sink().producer_count(), 0);
    assert_eq!(handle.wait().await, PipelineEnd::Stopped);
}

#[tokio::test]
async fn test_mixer_failure_resumes_the_source() {
    let source = source_file(80_000);
    let session = session_with(
        source.path(),
        Arc::new(FakeProcessor::with_bitrate("128k").mixer_fails()),
    );

    let (_, listener) = session.register_listener();
    let collector = collect_for(listener, Duration::from_millis(1000));
    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let effect = effect_file();
    let result = session.inject_effect(effect.path()).await;
    assert!(matches!(result, Err(Error::MergeFailed(_))));
    assert!(session.is_playing().await);

    let received = collector.await.unwrap();
    session.stop().await;

    // La source d'origine a repris là où elle s'était arrêtée
    assert!(received.bytes.len() > 10_000);
    assert_eq!(received.bytes, pattern(received.bytes.len()));
}

#[tokio::test]
async fn test_mixer_closing_at_once_resumes_the_source() {
    let source = source_file(200_000);
    let session = session_with(
        source.path(),
        Arc::new(FakeProcessor::with_bitrate("128k").mixer_dies_at_once()),
    );

    let (_, listener) = session.register_listener();
    let collector = collect_for(listener, Duration::from_millis(1000));
    let handle = session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let effect = effect_file();
    let result = session.inject_effect(effect.path()).await;
    assert!(matches!(result, Err(Error::MergeFailed(_))));
    assert!(session.is_playing().await);

    let received = collector.await.unwrap();
    assert!(!handle.is_finished());
    session.stop().await;

    assert!(received.bytes.len() > 10_000, "received {}", received.bytes.len());
    assert_eq!(received.bytes, pattern(received.bytes.len()));
}

#[tokio::test]
async fn test_mixer_dying_midway_keeps_broadcasting() {
    // Le mixeur rend 0,5 s d'audio puis meurt
    let source = source_file(200_000);
    let session = session_with(
        source.path(),
        Arc::new(FakeProcessor::with_bitrate("128k").mixer_dies_after(8_000)),
    );

    let (_, listener) = session.register_listener();
    let collector = collect_for(listener, Duration::from_millis(1500));
    let handle = session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let effect = effect_file();
    session.inject_effect(effect.path()).await.unwrap();

    let received = collector.await.unwrap();
    assert!(!handle.is_finished());
    assert!(matches!(session.phase().await, Phase::Playing { .. }));
    session.stop().await;

    // La source reprend après la mort du mixeur, au plus un saut
    assert!(received.bytes.len() > 18_000, "received {}", received.bytes.len());
    assert_eq!(received.bytes[..4_000], pattern(4_000)[..]);
    assert!(discontinuities(&received.bytes) <= 1);
}

#[tokio::test]
async fn test_restart_during_injection_plays_from_the_start() {
    let source = source_file(80_000);
    let processor =
        Arc::new(FakeProcessor::with_bitrate("128k").mixer_delay(Duration::from_millis(300)));
    let session = session_with(source.path(), processor);
    let first_run = session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let effect = effect_file();

    let injection = {
        let session = session.clone();
        let path = effect.path().to_path_buf();
        tokio::spawn(async move { session.inject_effect(path).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(session.phase().await, Phase::Splicing { .. }));

    // Rien n'est émis pendant la bascule : l'auditeur ne voit que le nouveau run
    let (_, listener) = session.register_listener();
    let collector = collect_for(listener, Duration::from_millis(500));
    let second_run = session.start().await.unwrap();

    assert!(matches!(injection.await.unwrap(), Err(Error::NotPlaying)));
    assert_eq!(first_run.wait().await, PipelineEnd::Stopped);
    assert_eq!(session.sink().producer_count(), 1);
    assert!(matches!(session.phase().await, Phase::Playing { .. }));
    assert!(!second_run.is_finished());

    let received = collector.await.unwrap();
    session.stop().await;

    assert!(received.bytes.len() > 4_000, "received {}", received.bytes.len());
    assert_eq!(received.bytes, pattern(received.bytes.len()));
}

#[tokio::test]
async fn test_stalled_listener_does_not_cause_a_burst() {
    // 16000 octets/s, chunks de 1600 octets
    let source = source_file(200_000);
    let settings = BroadcastSettings::default()
        .with_source(source.path())
        .with_listener_buffer(1);
    let session = BroadcastSession::new(settings, Arc::new(FakeProcessor::with_bitrate("128k")));

    let (_, listener) = session.register_listener();
    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let received = collect_for(listener, Duration::from_millis(500)).await.unwrap();
    session.stop().await;

    // 0,5 s de lecture, plus les chunks retenus dans le pipeline et un chunk
    // d'avance : 32000 octets de retard ne sont pas rattrapés
    assert!(received.bytes.len() > 4_000, "received {}", received.bytes.len());
    assert!(received.bytes.len() < 24_000, "received {}", received.bytes.len());
    assert_eq!(received.bytes, pattern(received.bytes.len()));
}

#[tokio::test]
async fn test_missing_effect_is_not_found() {
    let source = source_file(80_000);
    let processor = Arc::new(FakeProcessor::with_bitrate("128k"));
    let session = session_with(source.path(), processor.clone());
    session.start().await.unwrap();

    let result = session.inject_effect("/nonexistent/fx.mp3").await;
    assert!(matches!(&result, Err(e) if e.is_not_found()));
    assert_eq!(processor.mixed_count(), 0);
    assert!(session.is_playing().await);
    session.stop().await;
}

#[tokio::test]
async fn test_injection_while_stopped_is_rejected() {
    let source = source_file(1_000);
    let session = session_with(source.path(), Arc::new(FakeProcessor::with_bitrate("64k")));
    let effect = effect_file();

    let result = session.inject_effect(effect.path()).await;
    assert!(matches!(result, Err(Error::NotPlaying)));
    assert_eq!(session.phase().await, Phase::Stopped);
}

#[tokio::test]
async fn test_stop_when_idle_keeps_listeners() {
    let source = source_file(1_000);
    let session = session_with(source.path(), Arc::new(FakeProcessor::with_bitrate("64k")));
    let (id, _listener) = session.register_listener();

    session.stop().await;
    session.stop().await;

    assert_eq!(session.phase().await, Phase::Stopped);
    assert!(session.registry().contains(id));
    assert_eq!(session.registry().len(), 1);
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let source = source_file(1_000);
    let session = session_with(source.path(), Arc::new(FakeProcessor::with_bitrate("64k")));
    let (id, listener) = session.register_listener();

    assert!(session.unregister_listener(id));
    assert!(!session.unregister_listener(id));
    drop(listener);
    assert!(session.registry().is_empty());
}

#[tokio::test]
async fn test_probe_failure_uses_fallback_bitrate() {
    let source = source_file(50_000);
    let settings = BroadcastSettings::default()
        .with_source(source.path())
        .with_fallback_bitrate(96_000);
    let session = BroadcastSession::new(
        settings,
        Arc::new(FakeProcessor::failing_probe("sox FAIL formats: can't open input")),
    );

    session.start().await.unwrap();
    assert_eq!(session.bitrate().await, Some(96_000));
    assert!(session.is_playing().await);
    session.stop().await;
}
