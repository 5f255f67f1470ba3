//! Full-lifecycle test of the bus engine through its public API:
//! discovery fills the catalog, a poll fills the cache, a write is
//! validated against a dynamically referenced bound, and an alarm scan
//! lands in the alarm list. The bus itself is a scripted playback.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use heatbus_gateway::cache::ParameterCache;
use heatbus_gateway::codec::Value;
use heatbus_gateway::error::WriteError;
use heatbus_gateway::handler::{BusHandler, HandlerOptions};
use heatbus_gateway::protocol::{Frame, PANEL_ADDRESS, SRC_ADDRESS, command};
use heatbus_gateway::transport::BusPort;

#[derive(Default)]
struct ScriptedBus {
    responses: Mutex<VecDeque<Frame>>,
    writes: Mutex<Vec<Frame>>,
}

impl ScriptedBus {
    fn queue(&self, source: u16, cmd: u8, payload: Vec<u8>) {
        self.responses.lock().push_back(Frame {
            destination: SRC_ADDRESS,
            source,
            command: cmd,
            payload,
        });
    }

    fn requests(&self, cmd: u8) -> Vec<Frame> {
        self.writes
            .lock()
            .iter()
            .filter(|f| f.command == cmd)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BusPort for ScriptedBus {
    fn connected(&self) -> bool {
        true
    }

    async fn receive_frame(&self, _timeout: Duration) -> Option<Frame> {
        self.responses.lock().pop_front()
    }

    async fn send_frame(&self, frame: &Frame, _flush_after: bool) -> bool {
        self.writes.lock().push(frame.clone());
        true
    }

    async fn reset_rx(&self) {}
}

fn push_cstr(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(0);
}

/// Controller-space struct reply: name, unit, type byte, extra byte,
/// 4-byte range block per entry.
fn struct_payload(first_index: u16, entries: &[(&str, &str, u8, u8, [u8; 4])]) -> Vec<u8> {
    let mut out = vec![entries.len() as u8];
    out.extend_from_slice(&first_index.to_le_bytes());
    for (name, unit, type_byte, extra, range) in entries {
        push_cstr(&mut out, name);
        push_cstr(&mut out, unit);
        out.push(*type_byte);
        out.push(*extra);
        out.extend_from_slice(range);
    }
    out
}

/// Panel-space struct reply: name, unit, exponent byte, type byte.
fn panel_struct_payload(first_index: u16, entries: &[(&str, &str, u8)]) -> Vec<u8> {
    let mut out = vec![entries.len() as u8];
    out.extend_from_slice(&first_index.to_le_bytes());
    for (name, unit, type_byte) in entries {
        push_cstr(&mut out, name);
        push_cstr(&mut out, unit);
        out.push(0);
        out.push(*type_byte);
    }
    out
}

fn values_payload(first_index: u16, values: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![values.len() as u8];
    out.extend_from_slice(&first_index.to_le_bytes());
    out.push(0);
    for value in values {
        out.extend_from_slice(value);
        out.push(0);
    }
    out
}

fn alarm_date(year: u16, month: u8, day: u8) -> Vec<u8> {
    let mut out = year.to_le_bytes().to_vec();
    out.extend_from_slice(&[month, day, 8, 15, 0]);
    out
}

const INT16_WRITABLE: u8 = 0x20 | 2;
const INT16_READONLY: u8 = 2;
const UINT8_WRITABLE: u8 = 0x20 | 4;

#[tokio::test]
async fn discover_poll_write_alarm_lifecycle() {
    let bus = Arc::new(ScriptedBus::default());
    let cache = Arc::new(ParameterCache::new());
    let opts = HandlerOptions {
        token_required: false,
        token_timeout: Duration::ZERO,
        ..HandlerOptions::default()
    };
    let handler = BusHandler::new(Arc::clone(&bus) as Arc<dyn BusPort>, Arc::clone(&cache), opts, None);

    // --- discovery -------------------------------------------------------
    // Session init runs first and reads its own (broadcast) reply.
    bus.queue(1, command::GET_SETTINGS_RESPONSE, Vec::new());
    // Wire 0: MaxSetPoint, read-only, no range. Wire 1: SetPoint, writable,
    // min absent and max referenced to stored index 0.
    bus.queue(
        1,
        command::GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE,
        struct_payload(
            0,
            &[
                ("MaxSetPoint", "C", INT16_READONLY, 0xC0, [0, 0, 0, 0]),
                ("SetPoint", "C", INT16_WRITABLE, 0x60, [0, 0, 0, 0]),
            ],
        ),
    );
    bus.queue(1, command::NO_DATA, Vec::new());
    bus.queue(
        PANEL_ADDRESS,
        command::GET_PARAMS_STRUCT_RESPONSE,
        panel_struct_payload(0, &[("DisplayContrast", "", UINT8_WRITABLE)]),
    );
    bus.queue(PANEL_ADDRESS, command::NO_DATA, Vec::new());

    let discovered = handler.discover_params().await;
    assert_eq!(discovered, 3);
    assert!(!handler.has_token());

    // --- poll ------------------------------------------------------------
    bus.queue(
        1,
        command::GET_PARAMS_RESPONSE,
        values_payload(0, &[&[70, 0], &[45, 0]]),
    );
    bus.queue(
        PANEL_ADDRESS,
        command::GET_PARAMS_RESPONSE,
        values_payload(0, &[&[60]]),
    );

    let read = handler.poll_all_params(false).await;
    assert_eq!(read, 3);

    let reads = bus.requests(command::GET_PARAMS);
    assert_eq!(reads.len(), 2, "one batch per address space");
    assert_eq!(reads[0].destination, 1);
    assert_eq!(reads[0].payload, vec![2, 0, 0]);
    assert_eq!(reads[1].destination, PANEL_ADDRESS);
    assert_eq!(reads[1].payload, vec![1, 0, 0]);

    let set_point = cache.get_by_name("SetPoint").expect("SetPoint polled");
    assert_eq!(set_point.value, Value::Int(45));
    // The referenced bound was not cached while this batch was decoded,
    // so the first poll reports it unknown.
    assert_eq!(set_point.max_value, None);
    assert_eq!(set_point.min_value, None);
    assert_eq!(cache.get(10_000).unwrap().name, "DisplayContrast");

    // A second poll resolves the max bound out of the cache.
    bus.queue(
        1,
        command::GET_PARAMS_RESPONSE,
        values_payload(0, &[&[70, 0], &[45, 0]]),
    );
    bus.queue(
        PANEL_ADDRESS,
        command::GET_PARAMS_RESPONSE,
        values_payload(0, &[&[60]]),
    );
    handler.poll_all_params(false).await;
    assert_eq!(
        cache.get_by_name("SetPoint").unwrap().max_value,
        Some(70.0)
    );

    // --- write -----------------------------------------------------------
    let err = handler
        .write_param("SetPoint", Value::Int(75))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::AboveMaximum { max, .. } if max == 70.0));
    assert_eq!(cache.get_by_name("SetPoint").unwrap().value, Value::Int(45));

    bus.queue(1, command::MODIFY_PARAM_RESPONSE, Vec::new());
    handler
        .write_param("SetPoint", Value::Int(60))
        .await
        .expect("in-range write acknowledged");
    assert_eq!(cache.get_by_name("SetPoint").unwrap().value, Value::Int(60));
    assert!(!handler.has_token());

    let modifies = bus.requests(command::MODIFY_PARAM);
    assert_eq!(modifies.len(), 1, "rejected write never reached the bus");

    // --- alarms ----------------------------------------------------------
    let mut active = vec![9u8];
    active.extend_from_slice(&alarm_date(2026, 2, 3));
    active.extend_from_slice(&[0xFF; 7]);
    bus.queue(PANEL_ADDRESS, command::SERVICE_RESPONSE, active);
    let mut terminator = vec![0u8];
    terminator.extend_from_slice(&[0xFF; 7]);
    terminator.extend_from_slice(&[0xFF; 7]);
    bus.queue(PANEL_ADDRESS, command::SERVICE_RESPONSE, terminator);

    let alarms = handler.read_alarms().await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].code, 9);
    assert_eq!(alarms[0].to_date, None);
    assert_eq!(handler.alarms(), alarms);
    assert!(!handler.has_token());
}
