//! Shared harness for engine integration tests

#![allow(dead_code)]

use peercall_core::{
    CallEvent, EndReason, EngineConfig, LoopbackNetwork, LoopbackTransport, PeerId, RecordingDelegate,
    SignalingEngine, SignalingHandler, SignalingMessage, SignalingTransport, SimulatedMediaFactory,
    SimulatedMediaOptions, StateCode,
};
use std::sync::Arc;
use std::time::Duration;

pub const AUDIO_OFFER: &str = "v=0\r\no=- 77 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                               m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:audio\r\n";

pub const VIDEO_OFFER: &str = "v=0\r\no=- 78 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                               m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:audio\r\n\
                               m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:video\r\n";

/// One engine attached to the loopback network, pumping its inbox
pub struct TestPeer {
    pub id: PeerId,
    pub engine: Arc<SignalingEngine<LoopbackTransport>>,
    pub delegate: Arc<RecordingDelegate>,
    pub media: Arc<SimulatedMediaFactory>,
}

impl TestPeer {
    pub fn start(network: &LoopbackNetwork, id: &str) -> Self {
        Self::start_with(network, id, |_| {}, SimulatedMediaOptions::default())
    }

    pub fn start_with(
        network: &LoopbackNetwork,
        id: &str,
        configure: impl FnOnce(&mut EngineConfig),
        options: SimulatedMediaOptions,
    ) -> Self {
        let signaling = Arc::new(SignalingHandler::new(Arc::new(network.join(id))));
        let media = Arc::new(SimulatedMediaFactory::with_options(options));
        let delegate = Arc::new(RecordingDelegate::new());
        let mut config = EngineConfig::new(id);
        configure(&mut config);

        let engine = Arc::new(
            SignalingEngine::builder(signaling, media.clone())
                .with_config(config)
                .with_delegate(delegate.clone())
                .build()
                .unwrap(),
        );
        let pump = engine.clone();
        tokio::spawn(async move { pump.run().await });

        Self {
            id: PeerId::new(id),
            engine,
            delegate,
            media,
        }
    }

    pub fn ended_reasons(&self) -> Vec<EndReason> {
        self.delegate
            .events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::Ended { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn failed_codes(&self) -> Vec<StateCode> {
        self.delegate
            .events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::Failed { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }
}

/// Poll `check` until it holds or `limit` of (virtual) time passes
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Next message with the given action, skipping everything else
pub async fn recv_action(transport: &LoopbackTransport, action: &str) -> (PeerId, SignalingMessage) {
    loop {
        let (from, message) = tokio::time::timeout(Duration::from_secs(30), transport.receive_message())
            .await
            .unwrap_or_else(|_| panic!("no {action} message arrived"))
            .unwrap();
        if message.action() == action {
            return (from, message);
        }
    }
}

/// Send a hand-built message from a scripted peer
pub async fn send(transport: &LoopbackTransport, to: &str, message: SignalingMessage) {
    transport.send_message(&PeerId::new(to), message).await.unwrap();
}

pub fn invite(caller: &str, callee: &str, sdp: &str) -> SignalingMessage {
    SignalingMessage::Invite {
        caller: PeerId::new(caller),
        callee: PeerId::new(callee),
        sdp: sdp.to_string(),
        ice_servers: Vec::new(),
        caller_data: Default::default(),
    }
}

/// Let spawned tasks run for a while
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}
