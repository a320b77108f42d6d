use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{
    PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventCallback, PeerState, RemoteTrack,
};
use crate::config::Config;
use crate::media::LocalAudioTrack;
use crate::signaling::{DescriptionKind, IceCandidate, SessionDescription};

const FRAME_DURATION: Duration = Duration::from_millis(20);
// Opus TOC for a 20 ms CELT frame with an empty body; decoders render silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const STREAM_ID: &str = "voice-call";

fn build_api(setting: SettingEngine) -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Opens real peer connections through webrtc-rs.
pub struct WebRtcConnector {
    api: API,
    rtc_config: RTCConfiguration,
    inbound_packets: Arc<AtomicU64>,
    _router: Option<Arc<AsyncMutex<Router>>>,
}

impl WebRtcConnector {
    pub fn new(config: &Config) -> Result<Self, PeerError> {
        let mut setting = SettingEngine::default();
        if config.localhost_only {
            setting.set_include_loopback_candidate(true);
        }
        Self::with_setting(config, setting, None)
    }

    fn with_setting(
        config: &Config,
        setting: SettingEngine,
        router: Option<Arc<AsyncMutex<Router>>>,
    ) -> Result<Self, PeerError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };
        Ok(Self {
            api: build_api(setting)?,
            rtc_config,
            inbound_packets: Arc::new(AtomicU64::new(0)),
            _router: router,
        })
    }

    /// RTP packets received on every connection this connector opened.
    pub fn inbound_packets(&self) -> u64 {
        self.inbound_packets.load(Ordering::Relaxed)
    }
}

/// Two connectors joined by a virtual LAN, so calls can run without OS
/// networking access.
pub async fn virtual_pair(config: &Config) -> Result<(WebRtcConnector, WebRtcConnector), PeerError> {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .map_err(to_setup_error)?,
    ));

    let left_net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&left_net, &wan).await?;

    let right_net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach_vnet_to_router(&right_net, &wan).await?;

    {
        let mut router = wan.lock().await;
        router.start().await.map_err(to_setup_error)?;
    }

    let lan_config = Config {
        ice_servers: Vec::new(),
        ..config.clone()
    };
    let left = WebRtcConnector::with_setting(&lan_config, vnet_setting(left_net), Some(wan.clone()))?;
    let right = WebRtcConnector::with_setting(&lan_config, vnet_setting(right_net), Some(wan))?;
    Ok((left, right))
}

fn vnet_setting(net: Arc<Net>) -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_vnet(Some(net));
    setting.set_ice_timeouts(
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_millis(200)),
    );
    setting
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), PeerError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(nic_clone)
            .await
            .map_err(to_setup_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(to_setup_error)?;
    }
    Ok(())
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventCallback) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = Arc::clone(&events);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = Arc::clone(&candidate_events);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "voice.transport", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events(PeerEvent::LocalCandidate(from_candidate_init(init))),
                    Err(err) => {
                        warn!(target = "voice.transport", error = %err, "unserializable local candidate")
                    }
                }
            })
        }));

        let state_events = Arc::clone(&events);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = Arc::clone(&state_events);
            Box::pin(async move {
                debug!(target = "voice.transport", ?state, "peer connection state changed");
                if let Some(state) = map_state(state) {
                    events(PeerEvent::StateChanged(state));
                }
            })
        }));

        let track_events = events;
        let inbound_packets = Arc::clone(&self.inbound_packets);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = Arc::clone(&track_events);
                let counter = Arc::clone(&inbound_packets);
                Box::pin(async move {
                    events(PeerEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                    }));
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        trace!(target = "voice.transport", "remote track ended");
                    });
                })
            },
        ));

        Ok(Arc::new(WebRtcPeer {
            pc,
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(to_negotiation_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(to_negotiation_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_track(&self, track: &LocalAudioTrack) -> Result<(), PeerError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;

        // RTCP has to be read for interceptors to run.
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let source = track.clone();
        let pacer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            loop {
                ticker.tick().await;
                if source.is_stopped() {
                    break;
                }
                if !source.is_enabled() {
                    continue;
                }
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(err) = local.write_sample(&sample).await {
                    trace!(target = "voice.transport", error = %err, "audio frame dropped");
                }
            }
        });

        let mut pumps = self.pumps.lock();
        pumps.push(rtcp);
        pumps.push(pacer);
        Ok(())
    }

    async fn close(&self) {
        let pumps: Vec<JoinHandle<()>> = self.pumps.lock().drain(..).collect();
        for pump in pumps {
            pump.abort();
        }
        if let Err(err) = self.pc.close().await {
            warn!(target = "voice.transport", error = %err, "peer connection close failed");
        }
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::New
        | RTCPeerConnectionState::Closed
        | RTCPeerConnectionState::Unspecified => None,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => DescriptionKind::Offer,
        RTCSdpType::Answer => DescriptionKind::Answer,
        other => {
            return Err(PeerError::Negotiation(format!("unsupported sdp type {other}")));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_negotiation_error)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Negotiation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_and_new_states_are_not_reported() {
        assert_eq!(map_state(RTCPeerConnectionState::New), None);
        assert_eq!(map_state(RTCPeerConnectionState::Closed), None);
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Failed)
        );
    }

    #[test]
    fn candidate_init_fields_carry_over() {
        let candidate = from_candidate_init(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        });
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn offer_from_fresh_connection_is_an_offer() {
        let connector = WebRtcConnector::new(&Config::localhost()).unwrap();
        let peer = connector
            .connect(Arc::new(|_: PeerEvent| {}))
            .await
            .unwrap();
        peer.add_track(&LocalAudioTrack::new("mic")).await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert!(offer.sdp.contains("opus"));
        peer.close().await;
    }
}
