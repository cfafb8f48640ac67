//! One call, from endpoint discovery to teardown.
//!
//! A [`CallSession`] owns the video and audio UDP sockets for its whole life.
//! They are bound up front, used for STUN discovery and hole punching, then
//! handed to the media tasks. Teardown stops the tasks and releases both
//! sockets, whichever state the call ends in.
//!
//! Signals are not sent by the session itself: operations that produce a
//! signal return it, and the caller forwards it through whatever channel
//! connects the two users.
//!
//! A media task that fails while the call is `ACTIVE` ends the call on its
//! own: the session moves to `ENDED`, tears down, and keeps the failure for
//! the next [`CallSession::end`].

use media::{MediaDevices, MediaError, MediaLinks, MediaTasks};
use peercall_common::{CallConfig, EndpointPair, MetricsContext};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use traversal::{local_endpoint, HolePuncher, PunchError, PunchOutcome, StunClient};

use crate::error::CallError;
use crate::signal::{CallSignal, MediaEndpoints};
use crate::state::{CallEvent, CallState};

#[derive(Clone)]
struct MediaSockets {
    // ---
    video: Arc<UdpSocket>,
    audio: Arc<UdpSocket>,
}

enum MediaSlot {
    // ---
    Idle,
    Running(MediaTasks),
    Stopped,
}

/// Part of a session the media watcher shares.
struct Shared {
    // ---
    metrics: MetricsContext,
    state: Mutex<CallState>,
    sockets: Mutex<Option<MediaSockets>>,

    media: tokio::sync::Mutex<MediaSlot>,
    /// Media failure noticed by the watcher, reported by the next `end()`
    failure: Mutex<Option<MediaError>>,
    /// Raised by teardown; aborts punching and stops media
    cancel: CancellationToken,
    /// Child of `cancel`, also raised by a failing media task
    media_cancel: CancellationToken,
}

/// State machine and resources of one call.
///
/// All operations take `&self`; the accepting side and an end-call signal
/// may race freely. Media start and stop are serialized so the tasks are
/// spawned at most once and stopped exactly once.
pub struct CallSession {
    // ---
    config: CallConfig,
    stun: StunClient,
    puncher: HolePuncher,
    local: OnceLock<MediaEndpoints>,
    remote: OnceLock<MediaEndpoints>,
    shared: Arc<Shared>,
}

impl CallSession {
    // ---
    /// Binds the video and audio sockets on `ip` (ephemeral ports).
    ///
    /// Binding `0.0.0.0` serves every interface; the advertised local
    /// endpoint is then the interface that routes towards the STUN mapping.
    pub async fn bind(
        ip: Ipv4Addr,
        config: CallConfig,
        metrics: MetricsContext,
    ) -> Result<Self, CallError> {
        // ---
        let video = UdpSocket::bind((ip, 0)).await?;
        let audio = UdpSocket::bind((ip, 0)).await?;
        info!(
            "Call sockets bound: video {}, audio {}",
            video.local_addr()?,
            audio.local_addr()?
        );

        let cancel = CancellationToken::new();
        Ok(Self {
            stun: StunClient::new(config.stun.clone(), metrics.clone()),
            puncher: HolePuncher::new(config.punch.clone(), metrics.clone()),
            config,
            local: OnceLock::new(),
            remote: OnceLock::new(),
            shared: Arc::new(Shared {
                metrics,
                state: Mutex::new(CallState::Idle),
                sockets: Mutex::new(Some(MediaSockets {
                    video: Arc::new(video),
                    audio: Arc::new(audio),
                })),
                media: tokio::sync::Mutex::new(MediaSlot::Idle),
                failure: Mutex::new(None),
                media_cancel: cancel.child_token(),
                cancel,
            }),
        })
    }

    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    /// Our endpoints, once discovered.
    pub fn local_endpoints(&self) -> Option<MediaEndpoints> {
        self.local.get().copied()
    }

    /// The peer's endpoints, once its offer or answer arrived.
    pub fn remote_endpoints(&self) -> Option<MediaEndpoints> {
        self.remote.get().copied()
    }

    /// Whether the media tasks are currently running.
    pub async fn is_media_running(&self) -> bool {
        // ---
        matches!(*self.shared.media.lock().await, MediaSlot::Running(_))
    }

    /// Resolves once media has stopped, because the call ended or because
    /// a media task failed. In the latter case the call is already `ENDED`
    /// and [`CallSession::end`] reports the failure.
    pub async fn media_stopped(&self) {
        self.shared.media_cancel.cancelled().await
    }

    /// Caller side: discovers our endpoints and produces the offer.
    ///
    /// # Errors
    ///
    /// - [`CallError::Stun`] if discovery fails (the call is then `FAILED`)
    /// - [`CallError::InvalidTransition`] unless the call is `IDLE`
    pub async fn start_call(&self) -> Result<CallSignal, CallError> {
        // ---
        self.require(CallEvent::SendOffer)?;
        let endpoints = self.discover_or_fail().await?;
        self.advance(CallEvent::SendOffer)?;
        Ok(CallSignal::Offer { endpoints })
    }

    /// Callee side: records the caller's endpoints.
    pub fn receive_offer(&self, endpoints: MediaEndpoints) -> Result<(), CallError> {
        // ---
        self.advance(CallEvent::ReceiveOffer)?;
        let _ = self.remote.set(endpoints);
        info!("Incoming call from {}", endpoints.video.public.ip());
        Ok(())
    }

    /// Callee side: discovers our endpoints and produces the accepting answer.
    pub async fn accept(&self) -> Result<CallSignal, CallError> {
        // ---
        self.require(CallEvent::Accept)?;
        let endpoints = self.discover_or_fail().await?;
        self.advance(CallEvent::Accept)?;
        Ok(CallSignal::accept(endpoints))
    }

    /// Callee side: declines the offer and ends the call.
    pub async fn reject(&self) -> Result<CallSignal, CallError> {
        // ---
        self.advance(CallEvent::Reject)?;
        self.shared.teardown().await?;
        Ok(CallSignal::reject())
    }

    /// Caller side: applies the callee's answer.
    pub async fn handle_answer(
        &self,
        accepted: bool,
        endpoints: Option<MediaEndpoints>,
    ) -> Result<(), CallError> {
        // ---
        if !accepted {
            self.advance(CallEvent::AnswerRejected)?;
            info!("Call rejected by peer");
            return self.shared.teardown().await;
        }

        self.require(CallEvent::AnswerAccepted)?;
        let Some(endpoints) = endpoints else {
            self.shared.fail().await;
            return Err(CallError::MissingEndpoints);
        };
        self.advance(CallEvent::AnswerAccepted)?;
        let _ = self.remote.set(endpoints);
        Ok(())
    }

    /// Routes a signal from the peer to the matching operation.
    pub async fn handle_signal(&self, signal: CallSignal) -> Result<(), CallError> {
        // ---
        match signal {
            CallSignal::Offer { endpoints } => self.receive_offer(endpoints),
            CallSignal::Answer {
                accepted,
                endpoints,
            } => self.handle_answer(accepted, endpoints).await,
            CallSignal::End => {
                info!("Peer ended the call");
                self.end().await
            }
        }
    }

    /// Punches both media paths and starts the media tasks.
    ///
    /// Calling it again while punching or active is a no-op.
    ///
    /// # Errors
    ///
    /// - [`CallError::Punch`] if either path stays closed (the call is then
    ///   `FAILED`), or with [`PunchError::Cancelled`] if it ended meanwhile
    /// - [`CallError::InvalidTransition`] unless the call is `ACCEPTED`
    pub async fn connect(&self, devices: MediaDevices) -> Result<(), CallError> {
        // ---
        {
            let mut state = self.shared.lock_state();
            if matches!(*state, CallState::Punching | CallState::Active) {
                debug!("Connect while {}; nothing to do", *state);
                return Ok(());
            }
            *state = transition(*state, CallEvent::StartPunching)?;
        }

        let remote = self.remote.get().copied().ok_or(CallError::MissingEndpoints)?;
        let sockets = self.sockets()?;

        let punched = tokio::try_join!(
            self.punch(&sockets.video, &remote.video),
            self.punch(&sockets.audio, &remote.audio),
        );
        let (video, audio) = match punched {
            Ok(outcomes) => outcomes,
            Err(e) => {
                if !self.shared.cancel.is_cancelled() {
                    self.shared.fail().await;
                }
                return Err(e.into());
            }
        };

        let links = MediaLinks {
            video_socket: sockets.video,
            video_peer: video.peer,
            audio_socket: sockets.audio,
            audio_peer: audio.peer,
        };
        self.start_media(links, devices).await
    }

    /// Ends the call and releases its resources.
    ///
    /// Ending a call that is already over is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Media`] if a media task had failed, including a
    /// failure that already ended the call on its own; the call is `ENDED`
    /// regardless.
    pub async fn end(&self) -> Result<(), CallError> {
        // ---
        if !self.shared.mark_ended() {
            // Waits out a teardown still in progress
            let _slot = self.shared.media.lock().await;
            let failure = self
                .shared
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            return failure.map_or(Ok(()), |e| Err(CallError::Media(e)));
        }
        self.shared.teardown().await
    }

    async fn start_media(&self, links: MediaLinks, devices: MediaDevices) -> Result<(), CallError> {
        // ---
        let mut slot = self.shared.media.lock().await;
        match *slot {
            MediaSlot::Running(_) => {
                debug!("Media already running");
                return Ok(());
            }
            MediaSlot::Stopped => return Err(CallError::SocketClosed),
            MediaSlot::Idle => {}
        }

        // Under the media lock: an end() racing us either wins here or
        // finds the tasks running and stops them
        self.advance(CallEvent::PathOpen)?;
        *slot = MediaSlot::Running(MediaTasks::spawn(
            links,
            devices,
            &self.config,
            &self.shared.metrics,
            self.shared.media_cancel.clone(),
        ));
        self.shared.metrics.calls_active.inc();
        tokio::spawn(watch_media(Arc::clone(&self.shared)));
        Ok(())
    }

    async fn punch(
        &self,
        socket: &UdpSocket,
        peer: &EndpointPair,
    ) -> Result<PunchOutcome, PunchError> {
        // ---
        self.puncher.punch(socket, peer, &self.shared.cancel).await
    }

    async fn discover_or_fail(&self) -> Result<MediaEndpoints, CallError> {
        // ---
        match self.discover().await {
            Ok(endpoints) => {
                let _ = self.local.set(endpoints);
                Ok(endpoints)
            }
            Err(e) => {
                warn!("Call setup failed: {}", e);
                self.shared.fail().await;
                Err(e)
            }
        }
    }

    async fn discover(&self) -> Result<MediaEndpoints, CallError> {
        // ---
        if let Some(known) = self.local.get() {
            return Ok(*known);
        }
        let sockets = self.sockets()?;
        let (video, audio) = tokio::try_join!(
            self.discover_pair(&sockets.video),
            self.discover_pair(&sockets.audio),
        )?;
        info!("Our endpoints: video {}, audio {}", video, audio);
        Ok(MediaEndpoints { video, audio })
    }

    async fn discover_pair(&self, socket: &UdpSocket) -> Result<EndpointPair, CallError> {
        // ---
        let public = match self.stun.discover_public_endpoint(socket).await? {
            SocketAddr::V4(public) => public,
            other => return Err(CallError::UnusableMapping(other)),
        };
        let local: SocketAddrV4 = local_endpoint(socket, SocketAddr::V4(public))?;
        Ok(EndpointPair::new(local, public))
    }

    fn sockets(&self) -> Result<MediaSockets, CallError> {
        // ---
        self.shared
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CallError::SocketClosed)
    }

    /// Checks that `event` is allowed now, without applying it.
    fn require(&self, event: CallEvent) -> Result<(), CallError> {
        // ---
        transition(self.state(), event).map(|_| ())
    }

    fn advance(&self, event: CallEvent) -> Result<CallState, CallError> {
        self.shared.advance(event)
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    // ---
    fn lock_state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> CallState {
        *self.lock_state()
    }

    fn advance(&self, event: CallEvent) -> Result<CallState, CallError> {
        // ---
        let mut state = self.lock_state();
        let next = transition(*state, event)?;
        info!("Call {} -> {}", *state, next);
        *state = next;
        Ok(next)
    }

    /// Moves a live call to `ENDED`; `false` if it was already over.
    fn mark_ended(&self) -> bool {
        // ---
        let mut state = self.lock_state();
        if state.is_terminal() {
            return false;
        }
        info!("Call {} -> {}", *state, CallState::Ended);
        *state = CallState::Ended;
        true
    }

    async fn teardown(&self) -> Result<(), CallError> {
        // ---
        self.cancel.cancel();
        let mut slot = self.media.lock().await;
        self.release(&mut slot).await
    }

    /// Stops media and drops the sockets; the caller holds the media lock.
    async fn release(&self, slot: &mut MediaSlot) -> Result<(), CallError> {
        // ---
        let stopped = match std::mem::replace(slot, MediaSlot::Stopped) {
            MediaSlot::Running(tasks) => {
                self.metrics.calls_active.dec();
                tasks.stop().await
            }
            MediaSlot::Idle | MediaSlot::Stopped => Ok(()),
        };

        let released = self
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if released {
            debug!("Call sockets released");
        }

        stopped.map_err(|e| {
            warn!("Call ended after media failure: {}", e);
            CallError::Media(e)
        })
    }

    async fn fail(&self) {
        // ---
        if self.advance(CallEvent::Fail).is_ok() {
            if let Err(e) = self.teardown().await {
                debug!("Teardown after failure: {}", e);
            }
        }
    }
}

/// Ends the call when the media tasks stop without a teardown asking them to.
async fn watch_media(shared: Arc<Shared>) {
    // ---
    shared.media_cancel.cancelled().await;

    // Taken before the state so a racing end() waits for the failure to land
    let mut slot = shared.media.lock().await;
    if shared.cancel.is_cancelled() || !shared.mark_ended() {
        return;
    }
    warn!("Media stopped on its own; ending the call");
    shared.cancel.cancel();

    if let Err(CallError::Media(e)) = shared.release(&mut slot).await {
        *shared.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
    }
}

fn transition(from: CallState, event: CallEvent) -> Result<CallState, CallError> {
    // ---
    from.next(event)
        .ok_or(CallError::InvalidTransition { from, event })
}
