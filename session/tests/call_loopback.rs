//! Two call sessions on loopback, a fake STUN server and in-memory signaling.

use media::video::TestPattern;
use media::{ChannelAudioSink, ChannelFrameSink, MediaDevices, MediaError, QueuedFrames};
use peercall_common::{CallConfig, MetricsContext, PunchConfig, StunConfig};
use session::{CallError, CallSession, CallSignal, CallState, LineSignaling};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use traversal::stun::binding_success_for;
use traversal::{PunchError, StunError};

/// Answers every Binding Request with the sender's own address.
async fn spawn_stun_responder() -> SocketAddr {
    // ---
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if let Some(response) = binding_success_for(&buf[..len], from) {
                let _ = socket.send_to(&response, from).await;
            }
        }
    });
    addr
}

fn config(stun: SocketAddr) -> CallConfig {
    // ---
    CallConfig {
        stun: StunConfig {
            server: stun.to_string(),
            timeout_ms: 1000,
        },
        punch: PunchConfig {
            interval_ms: 50,
            attempts: 40,
        },
        ..CallConfig::default()
    }
}

async fn session(name: &str, config: &CallConfig) -> CallSession {
    // ---
    CallSession::bind(
        Ipv4Addr::LOCALHOST,
        config.clone(),
        MetricsContext::new(name).unwrap(),
    )
    .await
    .unwrap()
}

struct Observed {
    // ---
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    audio: mpsc::UnboundedReceiver<Vec<u8>>,
}

fn devices() -> (MediaDevices, Observed) {
    // ---
    let (frame_sink, frames) = ChannelFrameSink::new();
    let (audio_sink, audio) = ChannelAudioSink::new();
    let devices = MediaDevices {
        frame_source: Box::new(TestPattern::new(5000)),
        frame_sink: Box::new(frame_sink),
        audio_source: Box::new(media::audio::ToneSource::new(440.0, &Default::default())),
        audio_sink: Box::new(audio_sink),
    };
    (devices, Observed { frames, audio })
}

/// Drives both sessions to `ACCEPTED`, with signals on a duplex pipe.
async fn negotiate(caller: &CallSession, callee: &CallSession) {
    // ---
    let (a, b) = tokio::io::duplex(4096);
    let mut caller_line = LineSignaling::new(a);
    let mut callee_line = LineSignaling::new(b);

    let offer = caller.start_call().await.unwrap();
    assert_eq!(caller.state(), CallState::OfferSent);
    caller_line.send(&offer).await.unwrap();

    callee.handle_signal(callee_line.recv().await.unwrap()).await.unwrap();
    assert_eq!(callee.state(), CallState::OfferReceived);

    let answer = callee.accept().await.unwrap();
    callee_line.send(&answer).await.unwrap();
    caller.handle_signal(caller_line.recv().await.unwrap()).await.unwrap();

    assert_eq!(caller.state(), CallState::Accepted);
    assert_eq!(callee.state(), CallState::Accepted);
}

#[tokio::test]
async fn test_full_call_on_loopback() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;

    negotiate(&caller, &callee).await;
    assert_eq!(caller.remote_endpoints(), callee.local_endpoints());
    assert_eq!(callee.remote_endpoints(), caller.local_endpoints());

    let (caller_devices, mut caller_seen) = devices();
    let (callee_devices, mut callee_seen) = devices();
    let (a, b) = tokio::join!(caller.connect(caller_devices), callee.connect(callee_devices));
    a.unwrap();
    b.unwrap();
    assert_eq!(caller.state(), CallState::Active);
    assert_eq!(callee.state(), CallState::Active);

    for seen in [&mut caller_seen, &mut callee_seen] {
        let frame = timeout(Duration::from_secs(3), seen.frames.recv())
            .await
            .expect("video within 3s")
            .unwrap();
        assert_eq!(frame.len(), 5000);

        let chunk = timeout(Duration::from_secs(3), seen.audio.recv())
            .await
            .expect("audio within 3s")
            .unwrap();
        assert_eq!(chunk.len(), 640);
    }

    caller.end().await.unwrap();
    callee.handle_signal(CallSignal::End).await.unwrap();
    assert_eq!(caller.state(), CallState::Ended);
    assert_eq!(callee.state(), CallState::Ended);
    assert!(!caller.is_media_running().await);
    assert!(!callee.is_media_running().await);
    timeout(Duration::from_secs(1), caller.media_stopped())
        .await
        .expect("media token raised");
}

#[tokio::test]
async fn test_second_connect_is_noop() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;
    negotiate(&caller, &callee).await;

    let (caller_devices, _caller_seen) = devices();
    let (callee_devices, _callee_seen) = devices();
    let (a, b) = tokio::join!(caller.connect(caller_devices), callee.connect(callee_devices));
    a.unwrap();
    b.unwrap();

    let (again, _unused) = devices();
    caller.connect(again).await.unwrap();
    assert_eq!(caller.state(), CallState::Active);
    assert!(caller.is_media_running().await);

    caller.end().await.unwrap();
    caller.end().await.unwrap();
    callee.end().await.unwrap();
    assert_eq!(caller.state(), CallState::Ended);
}

#[tokio::test]
async fn test_rejected_call_ends_both_sides() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;

    let offer = caller.start_call().await.unwrap();
    callee.handle_signal(offer).await.unwrap();

    let answer = callee.reject().await.unwrap();
    assert_eq!(answer, CallSignal::reject());
    assert_eq!(callee.state(), CallState::Ended);

    caller.handle_signal(answer).await.unwrap();
    assert_eq!(caller.state(), CallState::Ended);

    let (devices, _seen) = devices();
    assert!(matches!(
        caller.connect(devices).await,
        Err(CallError::InvalidTransition {
            from: CallState::Ended,
            ..
        })
    ));
}

#[tokio::test]
async fn test_stun_timeout_fails_call() {
    // ---
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(silent.local_addr().unwrap());
    config.stun.timeout_ms = 200;
    let caller = session("caller", &config).await;

    let result = caller.start_call().await;
    assert!(matches!(result, Err(CallError::Stun(StunError::Timeout(_)))));
    assert_eq!(caller.state(), CallState::Failed);
    assert!(caller.local_endpoints().is_none());

    // Terminal: no second attempt on the same session
    assert!(matches!(
        caller.start_call().await,
        Err(CallError::InvalidTransition {
            from: CallState::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_silent_peer_fails_punch() {
    // ---
    let mut config = config(spawn_stun_responder().await);
    config.punch = PunchConfig {
        interval_ms: 30,
        attempts: 3,
    };
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;
    negotiate(&caller, &callee).await;

    // The callee never punches back
    let (devices, _seen) = devices();
    let result = caller.connect(devices).await;
    assert!(matches!(
        result,
        Err(CallError::Punch(PunchError::NoResponse { attempts: 3 }))
    ));
    assert_eq!(caller.state(), CallState::Failed);
    assert!(!caller.is_media_running().await);
}

#[tokio::test]
async fn test_end_while_punching_cancels() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;
    negotiate(&caller, &callee).await;

    let (devices, _seen) = devices();
    let connect = caller.connect(devices);
    let hang_up = async {
        tokio::time::sleep(Duration::from_millis(120)).await;
        caller.end().await
    };
    let (connected, ended) = tokio::join!(connect, hang_up);

    ended.unwrap();
    assert!(matches!(
        connected,
        Err(CallError::Punch(PunchError::Cancelled))
    ));
    assert_eq!(caller.state(), CallState::Ended);
}

#[tokio::test]
async fn test_accepting_answer_needs_endpoints() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    caller.start_call().await.unwrap();

    let result = caller
        .handle_signal(CallSignal::Answer {
            accepted: true,
            endpoints: None,
        })
        .await;
    assert!(matches!(result, Err(CallError::MissingEndpoints)));
    assert_eq!(caller.state(), CallState::Failed);
}

#[tokio::test]
async fn test_finite_source_keeps_call_active() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;
    negotiate(&caller, &callee).await;

    let (mut caller_devices, _caller_seen) = devices();
    caller_devices.frame_source = Box::new(QueuedFrames::new(vec![vec![9u8; 2000]]));
    let (callee_devices, mut callee_seen) = devices();
    let (a, b) = tokio::join!(caller.connect(caller_devices), callee.connect(callee_devices));
    a.unwrap();
    b.unwrap();

    let frame = timeout(Duration::from_secs(3), callee_seen.frames.recv())
        .await
        .expect("frame within 3s")
        .unwrap();
    assert_eq!(frame, vec![9u8; 2000]);

    // An exhausted source is not a media failure
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(caller.state(), CallState::Active);
    assert!(caller.is_media_running().await);

    caller.end().await.unwrap();
    callee.end().await.unwrap();
}

#[tokio::test]
async fn test_stray_datagram_does_not_redirect_media() {
    // ---
    let config = config(spawn_stun_responder().await);
    let caller = session("caller", &config).await;
    let callee = session("callee", &config).await;
    negotiate(&caller, &callee).await;

    // A third host reaches the caller's video socket before the callee does
    let stranger = UdpSocket::bind("127.0.0.2:0").await.unwrap();
    let caller_video = caller.local_endpoints().unwrap().video.local;
    stranger
        .send_to(b"hello-from-stranger", caller_video)
        .await
        .unwrap();

    let (caller_devices, _caller_seen) = devices();
    let (callee_devices, mut callee_seen) = devices();
    let (a, b) = tokio::join!(caller.connect(caller_devices), callee.connect(callee_devices));
    a.unwrap();
    b.unwrap();

    let frame = timeout(Duration::from_secs(3), callee_seen.frames.recv())
        .await
        .expect("caller video within 3s")
        .unwrap();
    assert_eq!(frame.len(), 5000);

    let mut buf = [0u8; 2048];
    assert!(
        timeout(Duration::from_millis(300), stranger.recv_from(&mut buf))
            .await
            .is_err(),
        "stranger received caller traffic"
    );

    caller.end().await.unwrap();
    callee.end().await.unwrap();
}

#[tokio::test]
async fn test_media_socket_failure_ends_call() {
    // ---
    let base = config(spawn_stun_responder().await);
    let mut failing = base.clone();
    // Fragments above the UDP datagram limit make every send fail
    failing.video.max_payload = 70_000;
    let caller = session("caller", &failing).await;
    let callee = session("callee", &base).await;
    negotiate(&caller, &callee).await;

    let (mut caller_devices, _caller_seen) = devices();
    caller_devices.frame_source = Box::new(QueuedFrames::new(vec![vec![1u8; 100_000]]));
    let (callee_devices, _callee_seen) = devices();
    let (a, b) = tokio::join!(caller.connect(caller_devices), callee.connect(callee_devices));
    a.unwrap();
    b.unwrap();

    timeout(Duration::from_secs(3), caller.media_stopped())
        .await
        .expect("media stops after the send failure");

    // Nobody called end(): the session ends itself
    timeout(Duration::from_secs(2), async {
        while caller.state() != CallState::Ended {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("call ended after media failure");
    assert!(!caller.is_media_running().await);

    assert!(matches!(
        caller.end().await,
        Err(CallError::Media(MediaError::SocketClosed(_)))
    ));
    caller.end().await.unwrap();
    callee.end().await.unwrap();
}
