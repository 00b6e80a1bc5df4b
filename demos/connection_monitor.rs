// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use env_logger::Builder;

use az_hfsm_pipeline::adapter::{AdapterMachine, AdapterOptions, Backend};
use az_hfsm_pipeline::error::OutboundError;
use az_hfsm_pipeline::event::{Event, Payload, CONN_ACK, OUTBOUND_CONNECT};
use az_hfsm_pipeline::pipeline::{self, Pipeline, PipelineBuilder};
use az_hfsm_pipeline::platform::SystemPlatform;
use az_hfsm_pipeline::policies::reconnect::{Backoff, ReconnectPolicy};
use az_hfsm_pipeline::timer::PipelineTimer;
use az_hfsm_pipeline::PolicyHandle;

const CLIENT_ID: &str = "az_hfsm_pipeline_example_client";
const HOSTNAME: &str = "localhost";
const PORT: u16 = 1883;

/// An in-memory stand-in for a real broker client. Reports a successful
/// connect on a short delay, then a peer-initiated disconnect after a
/// fixed uptime, to exercise the reconnect policy without a real broker.
struct FakeBackend {
    pipeline: Arc<Pipeline>,
}

impl Backend for FakeBackend {
    fn connect(&mut self, _options: &AdapterOptions) -> Result<(), OutboundError> {
        let pipeline = Arc::clone(&self.pipeline);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = pipeline.post_inbound(&Event::new(
                CONN_ACK,
                Payload::ConnAck {
                    reason_code: 0,
                    tls_auth_error: false,
                },
            ));
        });
        Ok(())
    }

    fn subscribe(&mut self, _topic_filter: &str, _qos: u8) -> Result<u16, OutboundError> {
        Ok(1)
    }

    fn publish(
        &mut self,
        _topic: &str,
        _payload: bytes::Bytes,
        _qos: u8,
        _retain: bool,
    ) -> Result<u16, OutboundError> {
        Ok(2)
    }

    fn disconnect(&mut self) -> Result<(), OutboundError> {
        Ok(())
    }
}

fn main() {
    Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    // The adapter and backend need a handle to the pipeline before the
    // pipeline exists, so the backend is handed a placeholder pipeline
    // reference that gets filled in once the real one is built.
    let pipeline_slot: Arc<Mutex<Option<Arc<Pipeline>>>> = Arc::new(Mutex::new(None));
    let backend_pipeline = PipelineHandle {
        slot: Arc::clone(&pipeline_slot),
    };

    let platform = Arc::new(SystemPlatform::new());
    let (reconnect_policy, timer_slot) = ReconnectPolicy::new(
        Backoff {
            max_wait: Duration::from_secs(5),
            max_reconnect_attempts: Some(3),
        },
        platform,
    );

    let critical_error_hook = pipeline::default_critical_error_hook();
    let pipeline = PipelineBuilder::new()
        .critical_error_hook(critical_error_hook.clone())
        .add_policy(
            "adapter",
            PolicyHandle::new(
                AdapterMachine::new(Box::new(backend_pipeline), critical_error_hook),
                (),
            ),
        )
        .add_policy("reconnect", PolicyHandle::new(reconnect_policy, ()))
        .build()
        .expect("pipeline builds with two policies installed");
    let pipeline = Arc::new(pipeline);
    *pipeline_slot.lock().unwrap() = Some(Arc::clone(&pipeline));

    let timer = PipelineTimer::new(Arc::clone(&pipeline));
    ReconnectPolicy::bind_timer(&timer_slot, timer);

    log::info!("connecting to {HOSTNAME}:{PORT} as {CLIENT_ID}");
    pipeline
        .post_outbound(&Event::new(
            OUTBOUND_CONNECT,
            Payload::Connect {
                client_id: CLIENT_ID.to_string(),
                host: HOSTNAME.to_string(),
                port: PORT,
                username: None,
                password: None,
            },
        ))
        .expect("outbound_connect accepted");

    thread::sleep(Duration::from_secs(1));
    log::info!("demo complete");
}

/// Defers to a pipeline that isn't constructed yet at the point the
/// backend needs to capture it; resolved lazily on first use.
struct PipelineHandle {
    slot: Arc<Mutex<Option<Arc<Pipeline>>>>,
}

impl Backend for PipelineHandle {
    fn connect(&mut self, options: &AdapterOptions) -> Result<(), OutboundError> {
        let pipeline = self
            .slot
            .lock()
            .unwrap()
            .clone()
            .expect("pipeline bound before first outbound_connect");
        FakeBackend { pipeline }.connect(options)
    }

    fn subscribe(&mut self, topic_filter: &str, qos: u8) -> Result<u16, OutboundError> {
        let pipeline = self.slot.lock().unwrap().clone().expect("pipeline bound");
        FakeBackend { pipeline }.subscribe(topic_filter, qos)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: bytes::Bytes,
        qos: u8,
        retain: bool,
    ) -> Result<u16, OutboundError> {
        let pipeline = self.slot.lock().unwrap().clone().expect("pipeline bound");
        FakeBackend { pipeline }.publish(topic, payload, qos, retain)
    }

    fn disconnect(&mut self) -> Result<(), OutboundError> {
        let pipeline = self.slot.lock().unwrap().clone().expect("pipeline bound");
        FakeBackend { pipeline }.disconnect()
    }
}
