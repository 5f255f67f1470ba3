//! Bus participation engine.
//!
//! Everything that talks on the RS-485 bus lives here: the panel
//! handshake / token state machine, the request-response correlator, the
//! two-address-space parameter discovery, the polling pipeline, the
//! authorized write path and the alarm reader, plus the supervisor loop
//! that sequences them.
//!
//! One async lock serializes every bus transaction; the full sequence
//! "acquire token -> send -> receive -> release token" runs under it, and
//! every path that acquires the token gives it back before the lock is
//! released, error paths included.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::ParameterCache;
use crate::codec::{CodecError, DataType, Value, decode_value, encode_value};
use crate::cycling::{AnticyclingDefaults, CompressorMonitor, apply_anticycling_defaults};
use crate::error::WriteError;
use crate::model::{Alarm, Parameter};
use crate::protocol::{
    ALARM_REQUEST_PREFIX, BROADCAST_ADDRESS, DEST_ADDRESSES, Frame, GET_TOKEN_FUNC,
    GIVE_BACK_TOKEN_DATA, IDENTIFY_RESPONSE_DATA, MODIFY_AUTH_HEADER, PANEL_ADDRESS,
    build_params_request, command,
};
use crate::transport::BusPort;

/// RS-485 line settle time before we transmit.
const TURNAROUND_DELAY: Duration = Duration::from_millis(20);
/// Per-read timeout inside a transaction. The configured request timeout
/// divided by this gives the silence budget in consecutive empty reads.
const FRAME_READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Per-read timeout while waiting for the token between transactions.
const TOKEN_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Struct entries requested per discovery batch.
const DISCOVERY_BATCH_SIZE: u8 = 100;
/// Transient-failure retries at one discovery index. Generous because the
/// token does not expire while we hold it.
const DISCOVERY_MAX_RETRIES: u32 = 10;
/// Attempts per poll batch before it is skipped this cycle.
const POLL_BATCH_RETRIES: u32 = 3;
/// Poll cycles between alarm scans.
const ALARM_SCAN_EVERY: u64 = 5;
/// Stored-index offset of the panel address space.
const PANEL_OFFSET: u32 = 10000;
/// A GET_PARAMS request covers at most this index span.
const MAX_BATCH_SPAN: u32 = 255;

/// Metadata for one parameter, as discovered from the bus.
///
/// `index` is the stored index. `min_ref`/`max_ref` carry the stored index
/// of another parameter whose current value supplies the bound; resolution
/// happens against the cache at use time, so there is no ordering
/// constraint between the two parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamStruct {
    pub index: u32,
    pub name: String,
    pub unit: u8,
    pub type_code: u8,
    pub writable: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub min_ref: Option<u32>,
    pub max_ref: Option<u32>,
}

/// Unit strings the controller reports, in unit-code order.
const UNIT_STRINGS: [&str; 9] = ["", "C", "s", "min", "h", "d", "%", "kW", "kWh"];

fn unit_code_from_str(unit: &str) -> u8 {
    UNIT_STRINGS
        .iter()
        .position(|&u| u == unit)
        .unwrap_or(0) as u8
}

/// Lossy UTF-8, trimmed, interior spaces replaced with underscores.
fn sanitize_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().replace(' ', "_")
}

/// Read a NUL-terminated byte run; returns (bytes, next offset).
fn read_cstr(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let nul = data[offset..].iter().position(|&b| b == 0)?;
    Some((&data[offset..offset + nul], offset + nul + 1))
}

/// Parse a GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE payload (controller
/// space). Per entry: NUL-terminated name, NUL-terminated unit string,
/// type byte (low nibble = type code, bit 0x20 = writable), extra byte,
/// then a 4-byte range block as two 16-bit halves (min, max).
///
/// Extra-byte bits select the range interpretation: 0x10/0x20 mark the
/// min/max half as a parameter-index reference, 0x40/0x80 mark it absent;
/// otherwise it is a literal, signed unless the type is unsigned.
pub fn parse_struct_response(data: &[u8]) -> Vec<ParamStruct> {
    if data.len() < 3 {
        return Vec::new();
    }
    let count = data[0] as usize;
    let first_index = u16::from_le_bytes([data[1], data[2]]) as u32;

    let mut entries = Vec::new();
    let mut offset = 3;

    for i in 0..count {
        if offset >= data.len() {
            break;
        }
        let Some((name_raw, next)) = read_cstr(data, offset) else {
            break;
        };
        offset = next;
        let Some((unit_raw, next)) = read_cstr(data, offset) else {
            break;
        };
        offset = next;

        if offset + 2 > data.len() {
            break;
        }
        let type_byte = data[offset];
        let extra_byte = data[offset + 1];
        offset += 2;

        let type_code = type_byte & 0x0F;
        let writable = type_byte & 0x20 != 0;
        let unsigned = DataType::from_code(type_code).is_some_and(DataType::is_unsigned);

        if offset + 4 > data.len() {
            break;
        }
        let half = |lo: usize| {
            let raw = [data[lo], data[lo + 1]];
            if unsigned {
                u16::from_le_bytes(raw) as f64
            } else {
                i16::from_le_bytes(raw) as f64
            }
        };

        let mut min_value = None;
        let mut max_value = None;
        let mut min_ref = None;
        let mut max_ref = None;

        if extra_byte & 0x10 != 0 {
            min_ref = Some(u16::from_le_bytes([data[offset], data[offset + 1]]) as u32);
        } else if extra_byte & 0x40 == 0 {
            min_value = Some(half(offset));
        }

        if extra_byte & 0x20 != 0 {
            max_ref = Some(u16::from_le_bytes([data[offset + 2], data[offset + 3]]) as u32);
        } else if extra_byte & 0x80 == 0 {
            max_value = Some(half(offset + 2));
        }

        offset += 4;

        entries.push(ParamStruct {
            index: first_index + i as u32,
            name: sanitize_name(name_raw),
            unit: unit_code_from_str(&String::from_utf8_lossy(unit_raw)),
            type_code,
            writable,
            min_value,
            max_value,
            min_ref,
            max_ref,
        });
    }

    entries
}

/// Parse a GET_PARAMS_STRUCT_RESPONSE payload (panel space). Per entry:
/// NUL-terminated name and unit, then an exponent byte and a type byte.
/// No range block in this variant.
pub fn parse_struct_response_no_range(data: &[u8]) -> Vec<ParamStruct> {
    if data.len() < 3 {
        return Vec::new();
    }
    let count = data[0] as usize;
    let first_index = u16::from_le_bytes([data[1], data[2]]) as u32;

    let mut entries = Vec::new();
    let mut offset = 3;

    for i in 0..count {
        if offset >= data.len() {
            break;
        }
        let Some((name_raw, next)) = read_cstr(data, offset) else {
            break;
        };
        offset = next;
        let Some((unit_raw, next)) = read_cstr(data, offset) else {
            break;
        };
        offset = next;

        if offset + 2 > data.len() {
            break;
        }
        // Exponent byte is carried but unused; values arrive pre-scaled.
        let type_byte = data[offset + 1];
        offset += 2;

        entries.push(ParamStruct {
            index: first_index + i as u32,
            name: sanitize_name(name_raw),
            unit: unit_code_from_str(&String::from_utf8_lossy(unit_raw)),
            type_code: type_byte & 0x0F,
            writable: type_byte & 0x20 != 0,
            min_value: None,
            max_value: None,
            min_ref: None,
            max_ref: None,
        });
    }

    entries
}

/// Parse a GET_PARAMS_RESPONSE payload into (stored index, value) pairs.
///
/// Layout: count, first wire index (LE16), one opaque separator byte, then
/// per value the type's wire width (strings NUL-terminated) followed by
/// another separator byte. Parsing stops at the first wire index with no
/// catalog entry, since the value width is unknowable from there on.
pub fn parse_get_params_response(
    data: &[u8],
    structs: &HashMap<u32, ParamStruct>,
    store_offset: u32,
) -> Vec<(u32, Value)> {
    if data.len() < 3 {
        return Vec::new();
    }
    let count = data[0] as usize;
    let first_index = u16::from_le_bytes([data[1], data[2]]) as u32;

    let mut results = Vec::new();
    let mut offset = 4; // header + leading separator

    for i in 0..count {
        let stored_index = first_index + i as u32 + store_offset;
        let Some(entry) = structs.get(&stored_index) else {
            break;
        };

        let value_len = if entry.type_code == DataType::String as u8 {
            match data[offset.min(data.len())..].iter().position(|&b| b == 0) {
                Some(nul) => nul + 1, // include the terminator
                None => break,
            }
        } else {
            match DataType::from_code(entry.type_code).and_then(DataType::wire_size) {
                Some(len) => len,
                None => break,
            }
        };

        if offset + value_len > data.len() {
            break;
        }

        match decode_value(&data[offset..offset + value_len], entry.type_code) {
            Ok(value) => results.push((stored_index, value)),
            Err(e) => {
                warn!("failed to decode param {stored_index}: {e}");
                break;
            }
        }

        offset += value_len + 1; // skip the separator after the value
    }

    results
}

/// MODIFY_PARAM payload: fixed authorization header, mode byte 0x01, the
/// stored index (fits 16 bits on the wire), then the encoded value.
pub fn build_modify_param_request(
    index: u32,
    value: &Value,
    type_code: u8,
) -> Result<Vec<u8>, CodecError> {
    let mut out = MODIFY_AUTH_HEADER.to_vec();
    out.push(0x01);
    out.extend_from_slice(&(index as u16).to_le_bytes());
    out.extend_from_slice(&encode_value(value, type_code)?);
    Ok(out)
}

/// Tunables for the handler, filled from the application settings.
#[derive(Clone, Debug)]
pub struct HandlerOptions {
    pub destination: u16,
    pub poll_interval: Duration,
    /// Upper bound on unbroken bus silence within one exchange; the
    /// correlator turns it into a count of consecutive empty reads.
    /// Traffic from bystanders extends the wall clock, never this.
    pub request_timeout: Duration,
    pub params_per_request: usize,
    pub token_required: bool,
    pub token_timeout: Duration,
    pub anticycling: Option<AnticyclingDefaults>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            destination: DEST_ADDRESSES[0],
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(2),
            params_per_request: 100,
            token_required: true,
            token_timeout: Duration::from_secs(30),
            anticycling: None,
        }
    }
}

/// The bus engine. Shared between the supervisor task and the REST layer.
pub struct BusHandler {
    port: Arc<dyn BusPort>,
    cache: Arc<ParameterCache>,
    opts: HandlerOptions,
    monitor: Option<Arc<CompressorMonitor>>,

    /// Silence budget per transaction, derived from the request timeout.
    max_silent_reads: u32,
    structs: RwLock<HashMap<u32, ParamStruct>>,
    alarms: RwLock<Vec<Alarm>>,
    has_token: AtomicBool,
    /// Serializes whole transactions: token -> request -> reply -> return.
    bus_lock: tokio::sync::Mutex<()>,

    running: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusHandler {
    pub fn new(
        port: Arc<dyn BusPort>,
        cache: Arc<ParameterCache>,
        opts: HandlerOptions,
        monitor: Option<Arc<CompressorMonitor>>,
    ) -> Self {
        let max_silent_reads = (opts.request_timeout.as_secs_f64()
            / FRAME_READ_TIMEOUT.as_secs_f64())
        .ceil()
        .max(1.0) as u32;
        Self {
            port,
            cache,
            opts,
            monitor,
            max_silent_reads,
            structs: RwLock::new(HashMap::new()),
            alarms: RwLock::new(Vec::new()),
            has_token: AtomicBool::new(false),
            bus_lock: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn connected(&self) -> bool {
        self.port.connected()
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_token(&self) -> bool {
        self.has_token.load(Ordering::SeqCst)
    }

    pub fn param_count(&self) -> usize {
        self.structs.read().len()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.read().clone()
    }

    // -----------------------------
    // Token state machine
    // -----------------------------

    /// React to a frame from the master panel: answer IDENTIFY probes and
    /// latch token grants. Idempotent; every probe gets an answer.
    async fn handle_panel_frame(&self, frame: &Frame) {
        match frame.command {
            command::IDENTIFY => {
                tokio::time::sleep(TURNAROUND_DELAY).await;
                let reply = Frame::new(
                    PANEL_ADDRESS,
                    command::IDENTIFY_RESPONSE,
                    IDENTIFY_RESPONSE_DATA.to_vec(),
                );
                self.port.send_frame(&reply, true).await;
                info!("answered IDENTIFY probe from panel");
            }
            command::SERVICE => {
                let func = frame
                    .payload
                    .get(..2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .unwrap_or(0);
                debug!("SERVICE frame from panel, func=0x{func:04X}");
                if func == GET_TOKEN_FUNC {
                    self.has_token.store(true, Ordering::SeqCst);
                    info!("bus token granted by panel");
                }
            }
            _ => {}
        }
    }

    /// Listen on the bus, answering probes, until the panel grants the
    /// token. Waits forever when the token is required; otherwise gives up
    /// after the configured timeout and proceeds without it.
    async fn wait_for_token(&self) {
        if !self.opts.token_required && self.opts.token_timeout.is_zero() {
            return;
        }
        if self.has_token() {
            return;
        }

        let deadline = if self.opts.token_required {
            trace!("waiting for bus token (indefinite)");
            None
        } else {
            trace!("waiting for bus token ({:?} timeout)", self.opts.token_timeout);
            Some(tokio::time::Instant::now() + self.opts.token_timeout)
        };

        loop {
            let read_timeout = match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        debug!("token wait timed out, proceeding without token");
                        return;
                    }
                    TOKEN_READ_TIMEOUT.min(deadline - now)
                }
                None => TOKEN_READ_TIMEOUT,
            };

            let Some(frame) = self.port.receive_frame(read_timeout).await else {
                continue;
            };

            trace!(
                "bus: src={} dst={} cmd=0x{:02X} len={}",
                frame.source,
                frame.destination,
                frame.command,
                frame.payload.len()
            );

            if !frame.is_for_us() {
                continue;
            }
            if frame.source == PANEL_ADDRESS {
                self.handle_panel_frame(&frame).await;
                if self.has_token() {
                    return;
                }
            }
        }
    }

    /// Hand the token back to the panel.
    async fn return_token(&self) {
        let frame = Frame::new(PANEL_ADDRESS, command::SERVICE, GIVE_BACK_TOKEN_DATA.to_vec());
        self.port.send_frame(&frame, false).await;
        self.has_token.store(false, Ordering::SeqCst);
        info!("bus token returned to panel");
    }

    /// Every transaction exits through here, whatever happened inside.
    async fn release_token_if_held(&self) {
        if self.has_token() {
            self.return_token().await;
        }
    }

    // -----------------------------
    // Request/response correlator
    // -----------------------------

    /// One on-wire transaction: settle, send, then read until the matching
    /// reply, a terminal code, or the silence budget runs out.
    ///
    /// Bystander frames are skipped but reset the silence counter; only an
    /// empty read ticks it. Panel IDENTIFY/SERVICE frames are fed to the
    /// token state machine on the way past. Retries belong to the caller.
    async fn exchange(
        &self,
        cmd: u8,
        payload: Vec<u8>,
        expected_response: u8,
        also_accept: &[u8],
        validator: Option<&(dyn Fn(&Frame) -> bool + Sync)>,
        destination: Option<u16>,
    ) -> Option<Frame> {
        let dest = destination.unwrap_or(self.opts.destination);
        let request = Frame::new(dest, cmd, payload);

        tokio::time::sleep(TURNAROUND_DELAY).await;

        if !self.port.send_frame(&request, true).await {
            warn!("failed to send command 0x{cmd:02X}");
            return None;
        }

        // Stray bytes buffered before the flush must not masquerade as the
        // reply.
        self.port.reset_rx().await;

        let mut silent_reads = 0u32;
        let mut skipped = 0u32;

        while silent_reads < self.max_silent_reads {
            let Some(response) = self.port.receive_frame(FRAME_READ_TIMEOUT).await else {
                silent_reads += 1;
                continue;
            };
            silent_reads = 0;

            if !response.is_for_us() {
                skipped += 1;
                continue;
            }

            // Panel protocol frames ride along with any transaction; only
            // these two commands are intercepted so panel data replies
            // still get through when the panel is the responder.
            if response.source == PANEL_ADDRESS
                && matches!(response.command, command::IDENTIFY | command::SERVICE)
            {
                self.handle_panel_frame(&response).await;
                skipped += 1;
                continue;
            }

            if response.source != dest && dest != BROADCAST_ADDRESS {
                skipped += 1;
                continue;
            }

            // Terminal codes (NO_DATA / ERROR) return as-is, unvalidated.
            if also_accept.contains(&response.command) {
                return Some(response);
            }

            if response.command != expected_response {
                skipped += 1;
                continue;
            }

            if let Some(validate) = validator {
                if !validate(&response) {
                    trace!(
                        "validator rejected frame cmd=0x{:02X} len={}",
                        response.command,
                        response.payload.len()
                    );
                    skipped += 1;
                    continue;
                }
            }

            return Some(response);
        }

        if skipped > 0 {
            debug!("no matching response for 0x{cmd:02X} (skipped {skipped} frames)");
        }
        None
    }

    /// Session init broadcast after acquiring the token. The reply is
    /// informational only; a silent controller is not an error.
    async fn send_get_settings(&self) {
        let response = self
            .exchange(
                command::GET_SETTINGS,
                Vec::new(),
                command::GET_SETTINGS_RESPONSE,
                &[],
                None,
                Some(BROADCAST_ADDRESS),
            )
            .await;
        match response {
            Some(reply) => debug!(
                "GET_SETTINGS response received ({} bytes)",
                reply.payload.len()
            ),
            None => debug!("no GET_SETTINGS response (non-critical)"),
        }
    }

    // -----------------------------
    // Discovery
    // -----------------------------

    /// One struct-metadata request. Returns the parsed entries (wire
    /// indices) and whether the space reported its end (NO_DATA / ERROR).
    async fn fetch_param_structs(
        &self,
        start_index: u16,
        count: u8,
        destination: Option<u16>,
        with_range: bool,
    ) -> (Vec<ParamStruct>, bool) {
        let payload = build_params_request(start_index, count);
        let (send_cmd, expect_cmd) = if with_range {
            (
                command::GET_PARAMS_STRUCT_WITH_RANGE,
                command::GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE,
            )
        } else {
            (
                command::GET_PARAMS_STRUCT,
                command::GET_PARAMS_STRUCT_RESPONSE,
            )
        };

        let starts_where_asked = move |frame: &Frame| {
            frame.payload.len() >= 3
                && u16::from_le_bytes([frame.payload[1], frame.payload[2]]) == start_index
        };

        let response = self
            .exchange(
                send_cmd,
                payload,
                expect_cmd,
                &[command::NO_DATA, command::ERROR],
                Some(&starts_where_asked),
                destination,
            )
            .await;

        match response {
            None => (Vec::new(), false),
            Some(frame) if frame.command == command::NO_DATA => {
                debug!("NO_DATA at wire index {start_index}");
                (Vec::new(), true)
            }
            Some(frame) if frame.command == command::ERROR => {
                debug!("ERROR at wire index {start_index}, treating as end of space");
                (Vec::new(), true)
            }
            Some(frame) => {
                let entries = if with_range {
                    parse_struct_response(&frame.payload)
                } else {
                    parse_struct_response_no_range(&frame.payload)
                };
                debug!(
                    "fetched {} param structs starting at wire index {start_index}",
                    entries.len()
                );
                (entries, false)
            }
        }
    }

    /// Walk one address space from wire index 0 until its terminal code,
    /// accumulating stored-index entries into the scratch catalog.
    async fn discover_address_space(
        &self,
        label: &str,
        store_offset: u32,
        destination: Option<u16>,
        with_range: bool,
        scratch: &mut HashMap<u32, ParamStruct>,
    ) -> bool {
        let mut wire_index: u16 = 0;
        let mut retries = 0u32;
        let mut batches = 0u32;

        loop {
            let (entries, end_of_space) = self
                .fetch_param_structs(wire_index, DISCOVERY_BATCH_SIZE, destination, with_range)
                .await;

            if end_of_space {
                info!("finished {label} discovery at wire index {wire_index} ({batches} batches)");
                return true;
            }

            if entries.is_empty() {
                retries += 1;
                if retries > DISCOVERY_MAX_RETRIES {
                    error!("{label} discovery failed at index {wire_index} after {DISCOVERY_MAX_RETRIES} retries");
                    return false;
                }
                warn!("no response for {label} index {wire_index}, retrying ({retries}/{DISCOVERY_MAX_RETRIES})");
                continue;
            }

            retries = 0;
            batches += 1;

            let last_wire = entries.last().map(|e| e.index).unwrap_or(wire_index as u32);
            for mut entry in entries {
                entry.index += store_offset;
                scratch.insert(entry.index, entry);
            }

            wire_index = (last_wire + 1) as u16;
        }
    }

    /// Discover both address spaces under a single token grant: controller
    /// first (with range data), then the panel. The live catalog is only
    /// replaced when the walk produced at least one entry.
    pub async fn discover_params(&self) -> usize {
        let _guard = self.bus_lock.lock().await;
        let started = std::time::Instant::now();
        let mut scratch: HashMap<u32, ParamStruct> = HashMap::new();

        self.wait_for_token().await;
        self.send_get_settings().await;
        self.port.reset_rx().await;

        self.discover_address_space("controller", 0, None, true, &mut scratch)
            .await;
        let controller_count = scratch.len();

        self.discover_address_space(
            "panel",
            PANEL_OFFSET,
            Some(PANEL_ADDRESS),
            false,
            &mut scratch,
        )
        .await;

        self.release_token_if_held().await;

        if scratch.is_empty() {
            warn!("parameter discovery returned no results, keeping existing catalog");
        } else {
            let panel_count = scratch.len() - controller_count;
            info!(
                "discovery complete: {} parameters ({controller_count} controller, {panel_count} panel) in {:.1}s",
                scratch.len(),
                started.elapsed().as_secs_f64()
            );
            *self.structs.write() = scratch;
        }

        self.param_count()
    }

    // -----------------------------
    // Polling
    // -----------------------------

    /// One value-read request. Returns (stored index, value) pairs.
    async fn fetch_param_values(
        &self,
        start_index: u16,
        count: u8,
        destination: Option<u16>,
        store_offset: u32,
    ) -> Vec<(u32, Value)> {
        let payload = build_params_request(start_index, count);

        let starts_where_asked = move |frame: &Frame| {
            frame.payload.len() >= 3
                && u16::from_le_bytes([frame.payload[1], frame.payload[2]]) == start_index
        };

        let response = self
            .exchange(
                command::GET_PARAMS,
                payload,
                command::GET_PARAMS_RESPONSE,
                &[],
                Some(&starts_where_asked),
                destination,
            )
            .await;

        match response {
            None => Vec::new(),
            Some(frame) => {
                let structs = self.structs.read();
                parse_get_params_response(&frame.payload, &structs, store_offset)
            }
        }
    }

    /// Late-bound range lookup: a reference wins over a literal, and an
    /// unresolvable reference means "unknown", not an error.
    fn resolve_bound(&self, reference: Option<u32>, literal: Option<f64>) -> Option<f64> {
        let Some(ref_index) = reference else {
            return literal;
        };
        {
            let structs = self.structs.read();
            match structs.get(&ref_index) {
                Some(entry) if !entry.name.is_empty() => {}
                _ => return None,
            }
        }
        self.cache.get(ref_index).and_then(|p| p.value.as_f64())
    }

    fn build_parameters(&self, values: &[(u32, Value)]) -> Vec<Parameter> {
        let mut out = Vec::with_capacity(values.len());
        for (index, value) in values {
            let Some(entry) = self.structs.read().get(index).cloned() else {
                continue;
            };
            if entry.name.is_empty() {
                continue;
            }
            let mut min_value = self.resolve_bound(entry.min_ref, entry.min_value);
            let mut max_value = self.resolve_bound(entry.max_ref, entry.max_value);
            if let (Some(min), Some(max)) = (min_value, max_value) {
                // An inverted range is controller garbage; unknown beats
                // wrong.
                if min > max {
                    warn!("parameter {index} reports min {min} > max {max}, dropping range");
                    min_value = None;
                    max_value = None;
                }
            }
            out.push(Parameter {
                index: *index,
                name: entry.name,
                value: value.clone(),
                type_code: entry.type_code,
                unit: entry.unit,
                writable: entry.writable,
                min_value,
                max_value,
            });
        }
        out
    }

    /// Read every cataloged parameter in contiguous batches and commit
    /// each batch to the cache atomically. A batch never crosses the
    /// address-space boundary and never spans more than 255 indices.
    /// With `scan_alarms`, an alarm sweep runs before the token goes back.
    pub async fn poll_all_params(&self, scan_alarms: bool) -> usize {
        let indices: Vec<u32> = {
            let structs = self.structs.read();
            let mut indices: Vec<u32> = structs.keys().copied().collect();
            indices.sort_unstable();
            indices
        };
        if indices.is_empty() {
            return 0;
        }

        let _guard = self.bus_lock.lock().await;
        self.wait_for_token().await;

        let mut total_read = 0usize;
        let mut pos = 0usize;

        while pos < indices.len() {
            let start = indices[pos];

            let mut end = pos + 1;
            let batch_limit = (pos + self.opts.params_per_request).min(indices.len());
            while end < batch_limit {
                if indices[end] - start >= MAX_BATCH_SPAN {
                    break;
                }
                if (start < PANEL_OFFSET) != (indices[end] < PANEL_OFFSET) {
                    break;
                }
                end += 1;
            }
            let count = (indices[end - 1] - start + 1) as u8;

            let is_panel = start >= PANEL_OFFSET;
            let destination = is_panel.then_some(PANEL_ADDRESS);
            let store_offset = if is_panel { PANEL_OFFSET } else { 0 };
            let wire_index = (start - store_offset) as u16;

            let mut values = Vec::new();
            for _ in 0..POLL_BATCH_RETRIES {
                values = self
                    .fetch_param_values(wire_index, count, destination, store_offset)
                    .await;
                if !values.is_empty() {
                    break;
                }
            }

            if values.is_empty() {
                debug!("batch at stored index {start} returned nothing, skipping");
                pos = end;
                continue;
            }

            let params = self.build_parameters(&values);
            total_read += params.len();
            self.cache.set_many(params);

            // Advance past whatever actually came back, and always at
            // least one position so the sweep terminates.
            let last_returned = values.last().map(|(i, _)| *i).unwrap_or(start);
            let mut new_pos = pos;
            while new_pos < indices.len() && indices[new_pos] <= last_returned {
                new_pos += 1;
            }
            pos = new_pos.max(pos + 1);
        }

        if scan_alarms {
            self.scan_alarm_slots().await;
        }

        self.release_token_if_held().await;
        total_read
    }

    // -----------------------------
    // Write path
    // -----------------------------

    /// Validate and write one parameter. The cache reflects the new value
    /// only after the controller acknowledged it.
    pub async fn write_param(&self, name: &str, value: Value) -> Result<(), WriteError> {
        let param = self
            .cache
            .get_by_name(name)
            .ok_or_else(|| WriteError::NotFound(name.to_string()))?;

        let entry = self
            .structs
            .read()
            .get(&param.index)
            .cloned()
            .ok_or_else(|| WriteError::NoStruct(name.to_string()))?;

        if !entry.writable {
            return Err(WriteError::ReadOnly(name.to_string()));
        }

        let min = self.resolve_bound(entry.min_ref, entry.min_value);
        let max = self.resolve_bound(entry.max_ref, entry.max_value);
        if let Some(v) = value.as_f64() {
            if let Some(min) = min {
                if v < min {
                    return Err(WriteError::BelowMinimum { value: v, min });
                }
            }
            if let Some(max) = max {
                if v > max {
                    return Err(WriteError::AboveMaximum { value: v, max });
                }
            }
        }

        let payload = build_modify_param_request(param.index, &value, entry.type_code)?;

        let response = {
            let _guard = self.bus_lock.lock().await;
            self.wait_for_token().await;
            let response = self
                .exchange(
                    command::MODIFY_PARAM,
                    payload,
                    command::MODIFY_PARAM_RESPONSE,
                    &[],
                    None,
                    None,
                )
                .await;
            self.release_token_if_held().await;
            response
        };

        match response {
            Some(_) => {
                let mut updated = param;
                updated.value = value;
                self.cache.set(updated);
                info!("parameter {name} written");
                Ok(())
            }
            None => {
                warn!("write of parameter {name} not acknowledged");
                Err(WriteError::NotAcknowledged)
            }
        }
    }

    // -----------------------------
    // Alarm reader
    // -----------------------------

    /// Walk alarm slots until a null start date or a missing reply, then
    /// atomically replace the alarm list, newest first. Token must be held.
    async fn scan_alarm_slots(&self) -> Vec<Alarm> {
        let mut alarms = Vec::new();
        let mut slot: u16 = 0;

        loop {
            let mut payload = ALARM_REQUEST_PREFIX.to_vec();
            payload.push((slot & 0xFF) as u8);

            let response = self
                .exchange(
                    command::SERVICE,
                    payload,
                    command::SERVICE_RESPONSE,
                    &[],
                    None,
                    Some(PANEL_ADDRESS),
                )
                .await;

            let Some(response) = response else {
                debug!("no alarm response at slot {slot}, stopping");
                break;
            };
            if response.payload.len() < 15 {
                debug!("short alarm reply at slot {slot}, stopping");
                break;
            }

            let code = response.payload[0];
            let Some(from_date) = decode_alarm_date(&response.payload[1..8]) else {
                debug!("null alarm at slot {slot}, end of list");
                break;
            };
            let to_date = decode_alarm_date(&response.payload[8..15]);

            trace!("alarm slot {slot}: code={code} from={from_date} to={to_date:?}");
            alarms.push(Alarm {
                index: slot,
                code,
                from_date,
                to_date,
            });
            slot += 1;
        }

        alarms.sort_by(|a, b| b.from_date.cmp(&a.from_date));
        info!("read {} alarms from controller", alarms.len());
        *self.alarms.write() = alarms.clone();
        alarms
    }

    /// Token-guarded alarm scan, usable outside a poll cycle.
    pub async fn read_alarms(&self) -> Vec<Alarm> {
        let _guard = self.bus_lock.lock().await;
        self.wait_for_token().await;
        let alarms = self.scan_alarm_slots().await;
        self.release_token_if_held().await;
        alarms
    }

    // -----------------------------
    // Supervisor
    // -----------------------------

    /// Spawn the background supervisor task.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = Arc::clone(self);
        let task = tokio::spawn(async move {
            handler.supervisor_loop().await;
        });
        *self.task.lock() = Some(task);
        info!("bus handler started");
    }

    /// Stop the supervisor. The current transaction finishes first, so the
    /// token is never orphaned.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("bus handler stopped");
    }

    async fn sleep_interval(&self) {
        let _ = tokio::time::timeout(self.opts.poll_interval, self.shutdown.notified()).await;
    }

    /// Reconnect-aware orchestration: discovery when the catalog is empty
    /// or the connection just came back, then poll cycles with periodic
    /// alarm scans. Failures are absorbed; the loop only exits on stop().
    async fn supervisor_loop(&self) {
        let mut was_connected = self.connected();
        let mut poll_count: u64 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut anticycling_pending = self.opts.anticycling.is_some();

        while self.running() {
            if !self.connected() {
                if was_connected {
                    warn!("connection lost, waiting for reconnection");
                    was_connected = false;
                }
                self.sleep_interval().await;
                continue;
            }

            if !was_connected {
                info!("connection restored, re-discovering parameters");
                was_connected = true;
                self.discover_params().await;
                self.read_alarms().await;
            }

            if self.param_count() == 0 {
                self.discover_params().await;
                self.read_alarms().await;
            }

            let scan_alarms = (poll_count + 1) % ALARM_SCAN_EVERY == 0;
            let read = self.poll_all_params(scan_alarms).await;

            if read > 0 {
                poll_count += 1;
                consecutive_failures = 0;

                if let Some(monitor) = &self.monitor {
                    monitor.update(&self.cache);
                }

                if anticycling_pending {
                    anticycling_pending = false;
                    if let Some(defaults) = self.opts.anticycling.clone() {
                        apply_anticycling_defaults(self, &self.cache, &defaults).await;
                    }
                }
            } else if self.param_count() > 0 {
                consecutive_failures += 1;
                if consecutive_failures <= 3 {
                    warn!("poll cycle read no parameters");
                }
            }

            self.sleep_interval().await;
        }
    }
}

/// Decode a 7-byte alarm date: LE16 year, then month, day, hour, minute,
/// second. All-0xFF means "no date".
fn decode_alarm_date(data: &[u8]) -> Option<chrono::NaiveDateTime> {
    if data.len() < 7 {
        return None;
    }
    if data[..7].iter().all(|&b| b == 0xFF) {
        return None;
    }
    let year = i16::from_le_bytes([data[0], data[1]]) as i32;
    let (month, day) = (data[2] as u32, data[3] as u32);
    let (hour, minute, second) = (data[4] as u32, data[5] as u32, data[6] as u32);
    if year < 1 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    chrono::NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}
