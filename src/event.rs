// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event kinds and payloads dispatched through the HFSM pipeline.

use bytes::Bytes;

/// Partitions the 32-bit [`Kind`] space so that independently developed
/// policies cannot collide on event identifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Facility {
    /// Intrinsic events understood by the HFSM/pipeline core itself.
    Hfsm = 0,
    /// Events produced or consumed by the MQTT adapter contract.
    Mqtt = 1,
    /// Reserved for higher-level IoT features layered on top of MQTT.
    Iot = 2,
    /// Reserved for application-defined events.
    User = 3,
}

/// An opaque event identifier, partitioned into a [`Facility`] and an
/// ordinal within that facility.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Kind(u32);

impl Kind {
    const FACILITY_SHIFT: u32 = 24;

    /// Builds a `Kind` from a facility and an ordinal unique within it.
    #[must_use]
    pub const fn new(facility: Facility, ordinal: u16) -> Self {
        Self(((facility as u32) << Self::FACILITY_SHIFT) | (ordinal as u32))
    }

    /// The facility this kind belongs to.
    #[must_use]
    pub const fn facility(self) -> Facility {
        match self.0 >> Self::FACILITY_SHIFT {
            0 => Facility::Hfsm,
            1 => Facility::Mqtt,
            2 => Facility::Iot,
            _ => Facility::User,
        }
    }

    /// The ordinal within [`Kind::facility`].
    #[must_use]
    pub const fn ordinal(self) -> u16 {
        (self.0 & 0x00FF_FFFF) as u16
    }
}

impl std::fmt::Debug for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kind({:?}:{})", self.facility(), self.ordinal())
    }
}

macro_rules! hfsm_kind {
    ($name:ident, $ord:expr) => {
        /// Intrinsic HFSM event kind.
        pub const $name: Kind = Kind::new(Facility::Hfsm, $ord);
    };
}

hfsm_kind!(ENTRY, 0);
hfsm_kind!(EXIT, 1);
hfsm_kind!(ERROR, 2);
hfsm_kind!(TIMEOUT, 3);
#[cfg(feature = "process-loop")]
hfsm_kind!(PROCESS_LOOP, 4);

macro_rules! mqtt_kind {
    ($name:ident, $ord:expr) => {
        /// MQTT adapter contract event kind.
        pub const $name: Kind = Kind::new(Facility::Mqtt, $ord);
    };
}

// Outbound requests: posted toward the adapter policy (`send_outbound`/
// `post_outbound`) by higher policies or the host application.
mqtt_kind!(OUTBOUND_CONNECT, 0);
mqtt_kind!(OUTBOUND_SUB, 1);
mqtt_kind!(OUTBOUND_PUB, 2);
mqtt_kind!(OUTBOUND_DISCONNECT, 3);

// Inbound completions/notifications: posted by the adapter (on the
// back-end's behalf) toward the application (`send_inbound`/`post_inbound`).
mqtt_kind!(CONN_ACK, 4);
mqtt_kind!(DISCONNECT, 5);
mqtt_kind!(PUB_ACK, 6);
mqtt_kind!(SUB_ACK, 7);
mqtt_kind!(RECV, 8);

// Posted inbound immediately alongside the outbound call that produced
// them, carrying the packet id the backend assigned, so a higher policy
// can correlate it with the `SubAck`/`PubAck` that completes it later.
mqtt_kind!(SUB_SUBMITTED, 9);
mqtt_kind!(PUB_SUBMITTED, 10);

/// An error code carried by an [`Payload::Error`] event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// No handler up to the root accepted the originating event.
    Unhandled,
    /// A handler explicitly rejected the originating event.
    Rejected,
    /// The adapter's back-end reported a condition the contract treats
    /// as unrecoverable.
    Fatal,
}

/// Payload carried by an [`Event`]. Closed over the kinds the core and
/// the MQTT adapter contract recognize; `Raw` is the extension point for
/// facilities this crate does not know about.
#[derive(Clone, Debug)]
pub enum Payload {
    /// No payload.
    None,
    /// Carried by [`ERROR`] events.
    Error {
        /// Category of failure.
        code: ErrorCode,
        /// The `Kind` whose dispatch produced this error.
        originating_kind: Kind,
        /// Optional human-readable detail, never parsed by the core.
        message: Option<String>,
    },
    /// A received publish, carried by the adapter's `Recv` event.
    Recv {
        /// Topic the message arrived on.
        topic: String,
        /// Message payload bytes.
        payload: Bytes,
        /// Quality of service the message was delivered at.
        qos: u8,
        /// Packet identifier (0 for QoS 0).
        packet_id: u16,
    },
    /// Carried by the adapter's `ConnAck` event.
    ConnAck {
        /// Reason code returned by the broker (0 = success).
        reason_code: u8,
        /// Set when the failure was a TLS/auth handshake failure.
        tls_auth_error: bool,
    },
    /// Carried by the adapter's `Disconnect` event.
    Disconnect {
        /// Set when the local side requested this disconnect.
        disconnect_requested: bool,
        /// Set when the disconnect followed a TLS/auth handshake failure.
        tls_auth_error: bool,
    },
    /// Carried by the adapter's `PubAck`/`SubAck` events.
    Acked {
        /// Packet identifier being acknowledged.
        packet_id: u16,
    },
    /// Carried by the `outbound_connect` request.
    Connect {
        /// Client identifier presented to the broker.
        client_id: String,
        /// FQDN or IP address of the broker.
        host: String,
        /// TCP port to connect to.
        port: u16,
        /// Username for broker-level authentication, if used.
        username: Option<String>,
        /// Password for broker-level authentication, if used.
        password: Option<String>,
    },
    /// Carried by the `outbound_sub` request.
    Sub {
        /// Topic filter to subscribe to.
        topic_filter: String,
        /// Requested quality of service.
        qos: u8,
    },
    /// Carried by the `outbound_pub` request.
    Pub {
        /// Topic to publish to.
        topic: String,
        /// Message payload bytes.
        payload: Bytes,
        /// Quality of service to publish at.
        qos: u8,
        /// Whether the broker should retain this message.
        retain: bool,
    },
    /// Extension point for facilities not known to this crate.
    Raw(Bytes),
}

/// A tagged event flowing through the pipeline.
#[derive(Clone, Debug)]
pub struct Event {
    kind: Kind,
    payload: Payload,
}

impl Event {
    /// Builds an event with the given kind and payload.
    #[must_use]
    pub fn new(kind: Kind, payload: Payload) -> Self {
        Self { kind, payload }
    }

    /// Builds a payload-less event.
    #[must_use]
    pub fn bare(kind: Kind) -> Self {
        Self::new(kind, Payload::None)
    }

    /// The event's kind.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The event's payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Builds the `Error` event redelivered per the crate's two error
    /// propagation mechanisms (see the pipeline module).
    #[must_use]
    pub fn error(originating_kind: Kind, code: ErrorCode, message: Option<String>) -> Self {
        Self::new(
            ERROR,
            Payload::Error {
                code,
                originating_kind,
                message,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_facility_and_ordinal() {
        let k = Kind::new(Facility::Mqtt, 7);
        assert_eq!(k.facility(), Facility::Mqtt);
        assert_eq!(k.ordinal(), 7);
    }

    #[test]
    fn intrinsic_kinds_are_hfsm_facility() {
        assert_eq!(ENTRY.facility(), Facility::Hfsm);
        assert_eq!(EXIT.facility(), Facility::Hfsm);
        assert_eq!(ERROR.facility(), Facility::Hfsm);
        assert_eq!(TIMEOUT.facility(), Facility::Hfsm);
    }
}
