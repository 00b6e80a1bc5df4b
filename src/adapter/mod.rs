// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The MQTT adapter contract: the normalized outbound operations and
//! inbound events a back-end library is translated into, plus the
//! adapter's own intrinsic connection-state machine.
//!
//! The adapter is installed as the outbound-most policy in a pipeline
//! (see [`crate::pipeline::PipelineBuilder::add_policy`]): outbound
//! requests posted by higher policies (`OUTBOUND_CONNECT`/`OUTBOUND_SUB`/
//! `OUTBOUND_PUB`/`OUTBOUND_DISCONNECT`) arrive here and are translated
//! into calls against a [`Backend`]; completions the back-end reports
//! later (on whatever thread it delivers them on) are posted back into
//! the pipeline as inbound events (`CONN_ACK`/`DISCONNECT`/`PUB_ACK`/
//! `SUB_ACK`/`RECV`, plus `SUB_SUBMITTED`/`PUB_SUBMITTED` carrying the
//! packet id assigned to a just-issued subscribe/publish) via
//! [`crate::pipeline::Pipeline::post_inbound`], which this policy, sitting
//! at the outbound endpoint, sees first and forwards further inbound to
//! the rest of the chain.

mod options;

pub use options::{AdapterOptions, AdapterOptionsBuilder};

use crate::error::OutboundError;
use crate::event::{
    Event, Payload, CONN_ACK, DISCONNECT, ENTRY, EXIT, OUTBOUND_CONNECT, OUTBOUND_DISCONNECT,
    OUTBOUND_PUB, OUTBOUND_SUB, PUB_ACK, PUB_SUBMITTED, RECV, SUB_ACK, SUB_SUBMITTED, TIMEOUT,
};
use crate::hfsm::{DispatchError, HandlerError, Machine, Outcome};
use crate::pipeline::CriticalErrorHook;
use crate::policy::PolicyCx;

/// The adapter's intrinsic connection state, mirroring the back-end
/// session lifecycle. This is a flat machine (no parent states): the
/// generic HFSM's hierarchical fallback is general machinery the adapter
/// simply doesn't need.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdapterState {
    /// No connection attempt outstanding.
    Idle,
    /// `outbound_connect` has been issued; awaiting `ConnAck`.
    Connecting,
    /// Connected; outbound publish/subscribe/disconnect are valid.
    Connected,
    /// `outbound_disconnect` has been issued; awaiting `Disconnect`.
    Disconnecting,
    /// The back-end reported a condition this contract treats as
    /// unrecoverable. No further outbound operation is accepted.
    Fatal,
}

/// What the adapter policy calls into to actually talk to a broker. A
/// concrete back-end (Mosquitto, Paho, an in-memory fake for tests) binds
/// this trait; the pipeline core and every policy above the adapter never
/// see it directly.
///
/// Implementations report completions asynchronously, from whatever
/// thread their underlying library delivers them on, by constructing the
/// matching inbound [`Event`] and calling
/// [`crate::pipeline::Pipeline::post_inbound`] on the pipeline they were
/// given at construction. This trait's methods only need to report
/// *submission* failures (e.g. a malformed topic) synchronously.
pub trait Backend: Send {
    /// Begins connecting, using `options`.
    fn connect(&mut self, options: &AdapterOptions) -> Result<(), OutboundError>;
    /// Begins subscribing to `topic_filter` at `qos`. Returns the packet
    /// id the eventual `SubAck` will reference.
    fn subscribe(&mut self, topic_filter: &str, qos: u8) -> Result<u16, OutboundError>;
    /// Begins publishing `payload` to `topic` at `qos`. Returns the packet
    /// id the eventual `PubAck` will reference (0 for QoS 0, which has no
    /// acknowledgment).
    fn publish(
        &mut self,
        topic: &str,
        payload: bytes::Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<u16, OutboundError>;
    /// Begins a clean disconnect.
    fn disconnect(&mut self) -> Result<(), OutboundError>;
}

/// The adapter policy's machine: tracks [`AdapterState`] and translates
/// between pipeline events and [`Backend`] calls.
pub struct AdapterMachine {
    state: AdapterState,
    backend: Box<dyn Backend>,
    critical_error_hook: CriticalErrorHook,
}

impl AdapterMachine {
    /// Builds a new adapter machine around `backend`. `critical_error_hook`
    /// should be the same hook installed on the pipeline this machine is
    /// added to (via [`crate::pipeline::PipelineBuilder::critical_error_hook`]),
    /// so that the one documented abort path — an unexpected unsubscribe
    /// callback from the back-end — reaches the host the same way any other
    /// critical error does. Install it in a pipeline via
    /// [`crate::policy::PolicyHandle::new`] with [`AdapterState::Idle`] as
    /// the initial state.
    pub fn new(backend: Box<dyn Backend>, critical_error_hook: CriticalErrorHook) -> Self {
        Self {
            state: AdapterState::Idle,
            backend,
            critical_error_hook,
        }
    }

    /// The adapter's current connection state.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.state
    }
}

impl Machine for AdapterMachine {
    type State = ();
    type Context<'a> = PolicyCx<'a>;

    fn parent(&self, _state: ()) -> Option<()> {
        None
    }

    fn dispatch(&mut self, cx: &mut PolicyCx<'_>, _state: (), event: &Event) -> Outcome {
        use AdapterState::{Connected, Connecting, Disconnecting, Fatal, Idle};

        if event.kind() == ENTRY || event.kind() == EXIT {
            return Outcome::Handled;
        }

        match (self.state, event.kind()) {
            (Idle, k) if k == OUTBOUND_CONNECT => {
                match self.options_from_event(event) {
                    Some(options) => match self.backend.connect(&options) {
                        Ok(()) => {
                            self.state = Connecting;
                            Outcome::Handled
                        }
                        Err(err) => Outcome::Failed(HandlerError::new(err.to_string())),
                    },
                    None => Outcome::Failed(HandlerError::new(
                        "outbound_connect requires connection parameters",
                    )),
                }
            }
            (Connecting, k) if k == CONN_ACK => {
                let failed = matches!(
                    event.payload(),
                    Payload::ConnAck { reason_code, .. } if *reason_code != 0
                );
                self.state = if failed { Idle } else { Connected };
                if failed {
                    let _ = cx.send_inbound(&Event::new(
                        DISCONNECT,
                        Payload::Disconnect {
                            disconnect_requested: false,
                            tls_auth_error: matches!(
                                event.payload(),
                                Payload::ConnAck { tls_auth_error: true, .. }
                            ),
                        },
                    ));
                }
                let _ = cx.send_inbound(event);
                Outcome::Handled
            }
            (Connected, k) if k == OUTBOUND_SUB => match event.payload() {
                Payload::Sub { topic_filter, qos } => match self.backend.subscribe(topic_filter, *qos) {
                    Ok(packet_id) => {
                        // Surfaces the packet id assigned to this subscribe
                        // back to the caller immediately, so a higher policy
                        // can correlate it with the SubAck that follows.
                        let _ = cx.send_inbound(&Event::new(SUB_SUBMITTED, Payload::Acked { packet_id }));
                        Outcome::Handled
                    }
                    Err(err) => Outcome::Failed(HandlerError::new(err.to_string())),
                },
                _ => Outcome::Failed(HandlerError::new("outbound_sub requires a Sub payload")),
            },
            (Connected, k) if k == OUTBOUND_PUB => match event.payload() {
                Payload::Pub {
                    topic,
                    payload,
                    qos,
                    retain,
                } => match self.backend.publish(topic, payload.clone(), *qos, *retain) {
                    Ok(packet_id) => {
                        let _ = cx.send_inbound(&Event::new(PUB_SUBMITTED, Payload::Acked { packet_id }));
                        Outcome::Handled
                    }
                    Err(err) => Outcome::Failed(HandlerError::new(err.to_string())),
                },
                _ => Outcome::Failed(HandlerError::new("outbound_pub requires a Pub payload")),
            },
            (Connected, k) if k == OUTBOUND_DISCONNECT => match self.backend.disconnect() {
                Ok(()) => {
                    self.state = Disconnecting;
                    Outcome::Handled
                }
                Err(err) => Outcome::Failed(HandlerError::new(err.to_string())),
            },
            (_, k) if k == PUB_ACK || k == SUB_ACK || k == RECV => {
                let _ = cx.send_inbound(event);
                Outcome::Handled
            }
            (Disconnecting, k) if k == DISCONNECT => {
                self.state = Idle;
                let _ = cx.send_inbound(event);
                Outcome::Handled
            }
            (Connected, k) if k == DISCONNECT => {
                // Peer-initiated disconnect while we were connected.
                self.state = Idle;
                let _ = cx.send_inbound(event);
                Outcome::Handled
            }
            (Fatal, _) => Outcome::Failed(HandlerError::new(
                "adapter is in the Fatal state and accepts no further events",
            )),
            // The adapter owns no timers of its own; any Timeout is relayed
            // to the next policy inward (e.g. a reconnect policy) rather
            // than rejected.
            (_, k) if k == TIMEOUT => {
                let _ = cx.send_inbound(event);
                Outcome::Handled
            }
            _ => Outcome::HandledBySuperState,
        }
    }
}

impl AdapterMachine {
    fn options_from_event(&self, event: &Event) -> Option<AdapterOptions> {
        match event.payload() {
            Payload::Connect {
                client_id,
                host,
                port,
                username,
                password,
            } => {
                let mut builder = AdapterOptionsBuilder::default()
                    .client_id(client_id.clone())
                    .hostname(host.clone())
                    .tcp_port(*port);
                if let Some(username) = username {
                    builder = builder.username(Some(username.clone()));
                }
                if let Some(password) = password {
                    builder = builder.password(Some(password.clone()));
                }
                builder.build().ok()
            }
            _ => None,
        }
    }

    /// Called by the back-end's unsubscribe callback path. Unsubscribe is
    /// not part of this adapter's outbound surface, so receiving this
    /// callback at all is a programming error in the back-end binding,
    /// not a recoverable protocol condition: it unconditionally invokes
    /// the critical-error hook and drives the adapter to
    /// [`AdapterState::Fatal`], asking the host to abort.
    pub fn on_unexpected_unsubscribe_callback(&mut self) {
        let err = DispatchError::Rejected(HandlerError::new(
            "adapter received an unsubscribe callback; this contract never issues unsubscribe",
        ));
        (self.critical_error_hook)(&err);
        self.state = AdapterState::Fatal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Facility;
    use crate::hfsm::Hfsm;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeBackend {
        connect_calls: Arc<AtomicU32>,
        publish_calls: Arc<AtomicU32>,
    }

    impl Backend for FakeBackend {
        fn connect(&mut self, _options: &AdapterOptions) -> Result<(), OutboundError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&mut self, _topic_filter: &str, _qos: u8) -> Result<u16, OutboundError> {
            Ok(1)
        }

        fn publish(
            &mut self,
            _topic: &str,
            _payload: Bytes,
            _qos: u8,
            _retain: bool,
        ) -> Result<u16, OutboundError> {
            self.publish_calls.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        }

        fn disconnect(&mut self) -> Result<(), OutboundError> {
            Ok(())
        }
    }

    fn silent_hook() -> CriticalErrorHook {
        std::sync::Arc::new(|_err: &DispatchError| {})
    }

    #[test]
    fn connect_then_connack_success_reaches_connected() {
        let backend = FakeBackend::default();
        let mut hfsm = Hfsm::new(AdapterMachine::new(Box::new(backend.clone()), silent_hook()));

        let mut harness = crate::policy::StandaloneCx::new();
        let mut cx = harness.cx();
        hfsm.init(&mut cx, ()).unwrap();
        hfsm.send(
            &mut cx,
            &Event::new(
                OUTBOUND_CONNECT,
                Payload::Connect {
                    client_id: "test-client".into(),
                    host: "broker.example".into(),
                    port: 8883,
                    username: None,
                    password: None,
                },
            ),
        )
        .unwrap();
        assert_eq!(hfsm.machine().state(), AdapterState::Connecting);

        hfsm.send(
            &mut cx,
            &Event::new(
                CONN_ACK,
                Payload::ConnAck {
                    reason_code: 0,
                    tls_auth_error: false,
                },
            ),
        )
        .unwrap();
        assert_eq!(hfsm.machine().state(), AdapterState::Connected);
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_callback_is_always_fatal_and_invokes_the_critical_error_hook() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let hook_calls_captured = hook_calls.clone();
        let hook: CriticalErrorHook = std::sync::Arc::new(move |_err: &DispatchError| {
            hook_calls_captured.fetch_add(1, Ordering::SeqCst);
        });
        let mut machine = AdapterMachine::new(Box::new(FakeBackend::default()), hook);
        machine.on_unexpected_unsubscribe_callback();
        assert_eq!(machine.state(), AdapterState::Fatal);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mqtt_kinds_are_mqtt_facility() {
        assert_eq!(OUTBOUND_CONNECT.facility(), Facility::Mqtt);
        assert_eq!(CONN_ACK.facility(), Facility::Mqtt);
    }
}
