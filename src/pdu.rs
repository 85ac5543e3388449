//! AgentX v1 wire codec: the fixed 20-byte header, typed value payloads and
//! the PDU bodies a subagent produces or consumes (RFC 2741 section 6).
//!
//! Integers on the wire use the byte order the session opener advertised in
//! the header flags. This subagent always opens with network byte order, but
//! the decoder honors whatever order each received header is stamped with.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::value::{tag, Value, VarBind};

pub const HEADER_SIZE: usize = 20;
pub const VERSION: u8 = 1;

/// Response error codes this subagent emits or inspects.
pub const NO_ERROR: u16 = 0;
pub const WRONG_VALUE: u16 = 10;
pub const NOT_WRITABLE: u16 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    Open = 1,
    Close = 2,
    Register = 3,
    Unregister = 4,
    Get = 5,
    GetNext = 6,
    GetBulk = 7,
    TestSet = 8,
    CommitSet = 9,
    UndoSet = 10,
    CleanupSet = 11,
    Notify = 12,
    Ping = 13,
    Response = 18,
}

impl TryFrom<u8> for PduType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PduType::Open),
            2 => Ok(PduType::Close),
            3 => Ok(PduType::Register),
            4 => Ok(PduType::Unregister),
            5 => Ok(PduType::Get),
            6 => Ok(PduType::GetNext),
            7 => Ok(PduType::GetBulk),
            8 => Ok(PduType::TestSet),
            9 => Ok(PduType::CommitSet),
            10 => Ok(PduType::UndoSet),
            11 => Ok(PduType::CleanupSet),
            12 => Ok(PduType::Notify),
            13 => Ok(PduType::Ping),
            18 => Ok(PduType::Response),
            other => Err(Error::Protocol(format!("unknown PDU type {}", other))),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const INSTANCE_REGISTRATION = 0x01;
        const NEW_INDEX = 0x02;
        const ANY_INDEX = 0x04;
        const NON_DEFAULT_CONTEXT = 0x08;
        const NETWORK_BYTE_ORDER = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn from_flags(flags: Flags) -> Self {
        if flags.contains(Flags::NETWORK_BYTE_ORDER) {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Reason codes for the Close PDU (RFC 2741 section 6.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    Other = 1,
    ParseError = 2,
    ProtocolError = 3,
    Timeouts = 4,
    Shutdown = 5,
    ByManager = 6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub pdu_type: PduType,
    pub flags: Flags,
    pub session_id: u32,
    pub transaction_id: u32,
    pub packet_id: u32,
    pub payload_length: u32,
}

impl Header {
    pub fn new(pdu_type: PduType, session_id: u32, transaction_id: u32, packet_id: u32) -> Self {
        Header {
            version: VERSION,
            pdu_type,
            flags: Flags::NETWORK_BYTE_ORDER,
            session_id,
            transaction_id,
            packet_id,
            payload_length: 0,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_flags(self.flags)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.push(self.pdu_type as u8);
        buf.push(self.flags.bits());
        buf.push(0); // reserved
        let order = self.byte_order();
        encode_u32(buf, self.session_id, order);
        encode_u32(buf, self.transaction_id, order);
        encode_u32(buf, self.packet_id, order);
        encode_u32(buf, self.payload_length, order);
    }

    /// Parse the fixed 20-byte header. The byte order of the integer fields
    /// is sniffed from the flags byte before any of them is read.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "short header: {} of {} bytes",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if buf[0] != VERSION {
            return Err(Error::Protocol(format!(
                "unsupported AgentX version {}",
                buf[0]
            )));
        }

        let pdu_type = PduType::try_from(buf[1])?;
        let flags = Flags::from_bits_truncate(buf[2]);
        let order = ByteOrder::from_flags(flags);

        let mut dec = Decoder::new(&buf[4..HEADER_SIZE], order);
        Ok(Header {
            version: buf[0],
            pdu_type,
            flags,
            session_id: dec.u32()?,
            transaction_id: dec.u32()?,
            packet_id: dec.u32()?,
            payload_length: dec.u32()?,
        })
    }
}

/// A GETNEXT/GETBULK search range. `end == None` is the null OID, meaning
/// the range is unbounded above. `include` is the include flag of the
/// encoded start OID: "the start itself is an acceptable answer".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRange {
    pub start: Oid,
    pub end: Option<Oid>,
    pub include: bool,
}

impl SearchRange {
    pub fn new(start: Oid, end: Option<Oid>, include: bool) -> Self {
        SearchRange {
            start,
            end,
            include,
        }
    }
}

// ---------------------------------------------------------------------------
// encoding primitives

pub fn encode_u16(buf: &mut Vec<u8>, v: u16, order: ByteOrder) {
    match order {
        ByteOrder::Big => buf.extend_from_slice(&v.to_be_bytes()),
        ByteOrder::Little => buf.extend_from_slice(&v.to_le_bytes()),
    }
}

pub fn encode_u32(buf: &mut Vec<u8>, v: u32, order: ByteOrder) {
    match order {
        ByteOrder::Big => buf.extend_from_slice(&v.to_be_bytes()),
        ByteOrder::Little => buf.extend_from_slice(&v.to_le_bytes()),
    }
}

pub fn encode_u64(buf: &mut Vec<u8>, v: u64, order: ByteOrder) {
    match order {
        ByteOrder::Big => buf.extend_from_slice(&v.to_be_bytes()),
        ByteOrder::Little => buf.extend_from_slice(&v.to_le_bytes()),
    }
}

/// Encode an OID, `None` being the null OID (zero sub-ids). A leading
/// `1.3.6.1.x` with `x <= 255` is elided into the prefix byte.
pub fn encode_oid(buf: &mut Vec<u8>, oid: Option<&Oid>, include: bool, order: ByteOrder) {
    let parts = oid.map(Oid::parts).unwrap_or(&[]);

    let (prefix, skip) = match parts {
        [1, 3, 6, 1, x, ..] if *x <= 255 => (*x as u8, 5),
        _ => (0, 0),
    };

    buf.push((parts.len() - skip) as u8);
    buf.push(prefix);
    buf.push(include as u8);
    buf.push(0); // reserved

    for part in &parts[skip..] {
        encode_u32(buf, *part, order);
    }
}

/// Length-prefixed byte sequence, zero-padded to a 4-byte boundary. The pad
/// bytes are not counted in the length.
pub fn encode_octet_string(buf: &mut Vec<u8>, data: &[u8], order: ByteOrder) {
    encode_u32(buf, data.len() as u32, order);
    buf.extend_from_slice(data);
    let pad = (4 - data.len() % 4) % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

fn encode_value_payload(buf: &mut Vec<u8>, value: &Value, order: ByteOrder) {
    match value {
        Value::Integer(v) => encode_u32(buf, *v as u32, order),
        Value::OctetString(v) | Value::Opaque(v) => encode_octet_string(buf, v, order),
        Value::Null | Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => {}
        Value::ObjectIdentifier(oid) => encode_oid(buf, Some(oid), false, order),
        Value::IpAddress(octets) => encode_octet_string(buf, octets, order),
        Value::Counter32(v) | Value::Gauge32(v) | Value::TimeTicks(v) => {
            encode_u32(buf, *v, order)
        }
        Value::Counter64(v) => encode_u64(buf, *v, order),
    }
}

pub fn encode_value(buf: &mut Vec<u8>, value: &Value, order: ByteOrder) {
    encode_u16(buf, value.tag(), order);
    encode_u16(buf, 0, order); // reserved
    encode_value_payload(buf, value, order);
}

/// Wire layout is tag, reserved, OID, payload.
pub fn encode_varbind(buf: &mut Vec<u8>, vb: &VarBind, order: ByteOrder) {
    encode_u16(buf, vb.value.tag(), order);
    encode_u16(buf, 0, order); // reserved
    encode_oid(buf, Some(&vb.oid), false, order);
    encode_value_payload(buf, &vb.value, order);
}

fn encode_search_range(buf: &mut Vec<u8>, range: &SearchRange, order: ByteOrder) {
    encode_oid(buf, Some(&range.start), range.include, order);
    encode_oid(buf, range.end.as_ref(), false, order);
}

fn encode_context(buf: &mut Vec<u8>, context: Option<&str>, order: ByteOrder) {
    if let Some(ctx) = context {
        encode_octet_string(buf, ctx.as_bytes(), order);
    }
}

/// Rewrite the `payload_length` field of a fully assembled frame. Encoders
/// emit the header first with a zero length and patch it once the body size
/// is known.
fn patch_payload_length(frame: &mut [u8], order: ByteOrder) {
    let len = (frame.len() - HEADER_SIZE) as u32;
    let bytes = match order {
        ByteOrder::Big => len.to_be_bytes(),
        ByteOrder::Little => len.to_le_bytes(),
    };
    frame[16..20].copy_from_slice(&bytes);
}

// ---------------------------------------------------------------------------
// decoding primitives

/// Cursor over a PDU body. Every read checks the remaining length; running
/// off the end of a short frame is a protocol error, never a panic.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Decoder { buf, pos: 0, order }
    }

    pub fn for_body(header: &Header, body: &'a [u8]) -> Self {
        Decoder::new(body, header.byte_order())
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Protocol(format!(
                "short PDU: wanted {} bytes, {} left",
                n,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(match self.order {
            ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
            ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
        })
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            ByteOrder::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(bytes),
            ByteOrder::Little => u64::from_le_bytes(bytes),
        })
    }

    /// Decode an OID and its include flag. The null OID decodes to `None`.
    pub fn oid(&mut self) -> Result<(Option<Oid>, bool)> {
        let n_subid = self.u8()? as usize;
        let prefix = self.u8()?;
        let include = self.u8()? != 0;
        self.u8()?; // reserved

        let mut parts = Vec::with_capacity(n_subid + 5);
        if prefix != 0 {
            parts.extend_from_slice(&[1, 3, 6, 1, prefix as u32]);
        }
        for _ in 0..n_subid {
            parts.push(self.u32()?);
        }

        if parts.is_empty() {
            Ok((None, include))
        } else {
            // cannot fail: parts is non-empty
            Ok((Some(Oid::from_parts(&parts).expect("non-empty")), include))
        }
    }

    pub fn octet_string(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        let data = self.take(len)?.to_vec();
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }

    pub fn value(&mut self) -> Result<Value> {
        let code = self.u16()?;
        self.u16()?; // reserved
        self.value_payload(code)
    }

    fn value_payload(&mut self, code: u16) -> Result<Value> {
        let value = match code {
            tag::INTEGER => Value::Integer(self.u32()? as i32),
            tag::OCTET_STRING => Value::OctetString(self.octet_string()?),
            tag::NULL => Value::Null,
            tag::OBJECT_IDENTIFIER => {
                let (oid, _) = self.oid()?;
                match oid {
                    Some(oid) => Value::ObjectIdentifier(oid),
                    None => return Err(Error::Protocol("null OID value".to_string())),
                }
            }
            tag::IP_ADDRESS => {
                let data = self.octet_string()?;
                match <[u8; 4]>::try_from(data.as_slice()) {
                    Ok(octets) => Value::IpAddress(octets),
                    Err(_) => {
                        return Err(Error::Protocol(format!(
                            "IpAddress with {} octets",
                            data.len()
                        )))
                    }
                }
            }
            tag::COUNTER32 => Value::Counter32(self.u32()?),
            tag::GAUGE32 => Value::Gauge32(self.u32()?),
            tag::TIME_TICKS => Value::TimeTicks(self.u32()?),
            tag::OPAQUE => Value::Opaque(self.octet_string()?),
            tag::COUNTER64 => Value::Counter64(self.u64()?),
            tag::NO_SUCH_OBJECT => Value::NoSuchObject,
            tag::NO_SUCH_INSTANCE => Value::NoSuchInstance,
            tag::END_OF_MIB_VIEW => Value::EndOfMibView,
            other => return Err(Error::Protocol(format!("unknown value type {}", other))),
        };

        Ok(value)
    }

    pub fn varbind(&mut self) -> Result<VarBind> {
        let code = self.u16()?;
        self.u16()?; // reserved
        let (oid, _) = self.oid()?;
        let oid = oid.ok_or_else(|| Error::Protocol("varbind with null OID".to_string()))?;
        let value = self.value_payload(code)?;
        Ok(VarBind::new(oid, value))
    }

    pub fn search_range(&mut self) -> Result<SearchRange> {
        let (start, include) = self.oid()?;
        let start = start.ok_or_else(|| Error::Protocol("null start OID".to_string()))?;
        let (end, _) = self.oid()?;
        Ok(SearchRange::new(start, end, include))
    }

    fn context(&mut self, header: &Header) -> Result<Option<String>> {
        if header.flags.contains(Flags::NON_DEFAULT_CONTEXT) {
            let raw = self.octet_string()?;
            Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
        } else {
            Ok(None)
        }
    }

    fn varbind_list(&mut self) -> Result<Vec<VarBind>> {
        let mut varbinds = Vec::new();
        while !self.is_empty() {
            varbinds.push(self.varbind()?);
        }
        Ok(varbinds)
    }

    fn search_range_list(&mut self) -> Result<Vec<SearchRange>> {
        let mut ranges = Vec::new();
        while !self.is_empty() {
            ranges.push(self.search_range()?);
        }
        Ok(ranges)
    }
}

// ---------------------------------------------------------------------------
// outbound frames

fn start_frame(header: &Header, context: Option<&str>) -> (Vec<u8>, ByteOrder) {
    let mut header = header.clone();
    if context.is_some() {
        header.flags |= Flags::NON_DEFAULT_CONTEXT;
    }
    let order = header.byte_order();
    let mut buf = Vec::with_capacity(HEADER_SIZE + 64);
    header.encode_into(&mut buf);
    encode_context(&mut buf, context, order);
    (buf, order)
}

fn finish_frame(mut buf: Vec<u8>, order: ByteOrder) -> Vec<u8> {
    patch_payload_length(&mut buf, order);
    buf
}

/// Open: timeout byte, 3 reserved bytes, agent-id OID (null here; the
/// subagent identifies itself by description), description octet string.
pub fn encode_open(header: &Header, timeout: u8, description: &str) -> Vec<u8> {
    let (mut buf, order) = start_frame(header, None);
    buf.push(timeout);
    buf.extend_from_slice(&[0, 0, 0]);
    encode_oid(&mut buf, None, false, order);
    encode_octet_string(&mut buf, description.as_bytes(), order);
    finish_frame(buf, order)
}

pub fn encode_close(header: &Header, reason: CloseReason) -> Vec<u8> {
    let (mut buf, order) = start_frame(header, None);
    buf.push(reason as u8);
    buf.extend_from_slice(&[0, 0, 0]);
    finish_frame(buf, order)
}

pub fn encode_register(
    header: &Header,
    context: Option<&str>,
    timeout: u8,
    priority: u8,
    subtree: &Oid,
) -> Vec<u8> {
    let (mut buf, order) = start_frame(header, context);
    buf.push(timeout);
    buf.push(priority);
    buf.push(0); // range_subid: whole-subtree registration
    buf.push(0); // reserved
    encode_oid(&mut buf, Some(subtree), false, order);
    finish_frame(buf, order)
}

pub fn encode_unregister(
    header: &Header,
    context: Option<&str>,
    priority: u8,
    subtree: &Oid,
) -> Vec<u8> {
    let (mut buf, order) = start_frame(header, context);
    buf.push(0); // reserved, no timeout on Unregister
    buf.push(priority);
    buf.push(0); // range_subid
    buf.push(0); // reserved
    encode_oid(&mut buf, Some(subtree), false, order);
    finish_frame(buf, order)
}

pub fn encode_ping(header: &Header, context: Option<&str>) -> Vec<u8> {
    let (buf, order) = start_frame(header, context);
    finish_frame(buf, order)
}

pub fn encode_notify(header: &Header, context: Option<&str>, varbinds: &[VarBind]) -> Vec<u8> {
    let (mut buf, order) = start_frame(header, context);
    for vb in varbinds {
        encode_varbind(&mut buf, vb, order);
    }
    finish_frame(buf, order)
}

/// Response reusing the ids of the PDU being answered. `parallel` routes the
/// varbind encoding through the batch encoder.
pub fn encode_response(
    header: &Header,
    sys_uptime: u32,
    error: u16,
    index: u16,
    varbinds: &[VarBind],
    parallel: bool,
) -> Vec<u8> {
    let mut header = header.clone();
    header.pdu_type = PduType::Response;
    header.flags &= Flags::NETWORK_BYTE_ORDER; // context never echoed back

    let order = header.byte_order();
    let mut buf = Vec::with_capacity(HEADER_SIZE + 8 + varbinds.len() * 24);
    header.encode_into(&mut buf);
    encode_u32(&mut buf, sys_uptime, order);
    encode_u16(&mut buf, error, order);
    encode_u16(&mut buf, index, order);

    if parallel {
        buf.extend_from_slice(&crate::parallel::concat_buffers(
            crate::parallel::encode_varbinds_batch(varbinds, order),
        ));
    } else {
        for vb in varbinds {
            encode_varbind(&mut buf, vb, order);
        }
    }

    finish_frame(buf, order)
}

/// Get and GetNext share one body shape.
#[derive(Debug, Clone)]
pub struct GetBody {
    pub context: Option<String>,
    pub ranges: Vec<SearchRange>,
}

pub fn decode_get(header: &Header, body: &[u8]) -> Result<GetBody> {
    let mut dec = Decoder::for_body(header, body);
    let context = dec.context(header)?;
    let ranges = dec.search_range_list()?;
    Ok(GetBody { context, ranges })
}

#[derive(Debug, Clone)]
pub struct GetBulkBody {
    pub context: Option<String>,
    pub non_repeaters: u16,
    pub max_repetitions: u16,
    pub ranges: Vec<SearchRange>,
}

pub fn decode_getbulk(header: &Header, body: &[u8]) -> Result<GetBulkBody> {
    let mut dec = Decoder::for_body(header, body);
    let context = dec.context(header)?;
    let non_repeaters = dec.u16()?;
    let max_repetitions = dec.u16()?;
    let ranges = dec.search_range_list()?;
    Ok(GetBulkBody {
        context,
        non_repeaters,
        max_repetitions,
        ranges,
    })
}

#[derive(Debug, Clone)]
pub struct TestSetBody {
    pub context: Option<String>,
    pub varbinds: Vec<VarBind>,
}

pub fn decode_testset(header: &Header, body: &[u8]) -> Result<TestSetBody> {
    let mut dec = Decoder::for_body(header, body);
    let context = dec.context(header)?;
    let varbinds = dec.varbind_list()?;
    Ok(TestSetBody { context, varbinds })
}

#[derive(Debug, Clone)]
pub struct ResponseBody {
    pub sys_uptime: u32,
    pub error: u16,
    pub index: u16,
    pub varbinds: Vec<VarBind>,
}

impl ResponseBody {
    pub fn is_error(&self) -> bool {
        self.error != NO_ERROR
    }
}

pub fn decode_response(header: &Header, body: &[u8]) -> Result<ResponseBody> {
    let mut dec = Decoder::for_body(header, body);
    let sys_uptime = dec.u32()?;
    let error = dec.u16()?;
    let index = dec.u16()?;
    let varbinds = dec.varbind_list()?;
    Ok(ResponseBody {
        sys_uptime,
        error,
        index,
        varbinds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(s: &str) -> Oid {
        s.parse().unwrap()
    }

    fn value_roundtrip(value: Value, order: ByteOrder) {
        let mut buf = Vec::new();
        encode_value(&mut buf, &value, order);
        let decoded = Decoder::new(&buf, order).value().unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn header_roundtrip_both_orders() {
        for flags in [Flags::NETWORK_BYTE_ORDER, Flags::empty()] {
            let mut header = Header::new(PduType::Open, 1, 2, 3);
            header.flags = flags;
            header.payload_length = 100;

            let mut buf = Vec::new();
            header.encode_into(&mut buf);
            assert_eq!(buf.len(), HEADER_SIZE);

            let decoded = Header::decode(&buf).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut buf = Vec::new();
        Header::new(PduType::Ping, 0, 0, 0).encode_into(&mut buf);
        buf[0] = 2;
        assert!(matches!(Header::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut buf = Vec::new();
        Header::new(PduType::Ping, 0, 0, 0).encode_into(&mut buf);
        buf[1] = 99;
        assert!(matches!(Header::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn header_rejects_short_input() {
        assert!(matches!(
            Header::decode(&[1, 13, 0x10]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oid_roundtrip() {
        for s in ["1.3.6.1.4.1.12345", "2.5.1", "1.3.6.1.255.1", "0.1"] {
            let mut buf = Vec::new();
            encode_oid(&mut buf, Some(&oid(s)), true, ByteOrder::Big);
            let (decoded, include) = Decoder::new(&buf, ByteOrder::Big).oid().unwrap();
            assert_eq!(decoded, Some(oid(s)));
            assert!(include);
        }
    }

    #[test]
    fn oid_internet_prefix_elision() {
        let mut buf = Vec::new();
        encode_oid(&mut buf, Some(&oid("1.3.6.1.4.1.12345")), false, ByteOrder::Big);
        assert_eq!(buf[0], 2); // n_subid after the elided 1.3.6.1.4
        assert_eq!(buf[1], 4); // prefix byte
        // 4 header bytes + 2 sub-ids
        assert_eq!(buf.len(), 4 + 2 * 4);
    }

    #[test]
    fn oid_no_elision_above_255() {
        let mut buf = Vec::new();
        encode_oid(&mut buf, Some(&oid("1.3.6.1.300.1")), false, ByteOrder::Big);
        assert_eq!(buf[0], 6);
        assert_eq!(buf[1], 0);
    }

    #[test]
    fn null_oid_roundtrip() {
        let mut buf = Vec::new();
        encode_oid(&mut buf, None, false, ByteOrder::Big);
        assert_eq!(buf.len(), 4);
        let (decoded, _) = Decoder::new(&buf, ByteOrder::Big).oid().unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn octet_string_padding() {
        // lengths 0..=4 cover all pad amounts
        for (len, expect) in [(0, 4), (1, 8), (2, 8), (3, 8), (4, 8)] {
            let data = vec![0xabu8; len];
            let mut buf = Vec::new();
            encode_octet_string(&mut buf, &data, ByteOrder::Big);
            assert_eq!(buf.len(), expect, "length {}", len);
            let decoded = Decoder::new(&buf, ByteOrder::Big).octet_string().unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn value_roundtrips() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            value_roundtrip(Value::Integer(-12345), order);
            value_roundtrip(Value::OctetString(b"hello world".to_vec()), order);
            value_roundtrip(Value::Null, order);
            value_roundtrip(Value::ObjectIdentifier(oid("1.3.6.1.4.1.12345.1")), order);
            value_roundtrip(Value::IpAddress([192, 168, 1, 1]), order);
            value_roundtrip(Value::Counter32(u32::MAX), order);
            value_roundtrip(Value::Gauge32(1_000_000), order);
            value_roundtrip(Value::TimeTicks(123_456_789), order);
            value_roundtrip(Value::Opaque(vec![0, 1, 2, 3]), order);
            value_roundtrip(Value::Counter64(u64::MAX), order);
            value_roundtrip(Value::NoSuchObject, order);
            value_roundtrip(Value::NoSuchInstance, order);
            value_roundtrip(Value::EndOfMibView, order);
        }
    }

    #[test]
    fn value_rejects_unknown_tag() {
        let mut buf = Vec::new();
        encode_u16(&mut buf, 99, ByteOrder::Big);
        encode_u16(&mut buf, 0, ByteOrder::Big);
        assert!(matches!(
            Decoder::new(&buf, ByteOrder::Big).value(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn varbind_roundtrip() {
        let vb = VarBind::new(oid("1.3.6.1.2.1.1.1.0"), Value::Integer(42));
        let mut buf = Vec::new();
        encode_varbind(&mut buf, &vb, ByteOrder::Big);
        let decoded = Decoder::new(&buf, ByteOrder::Big).varbind().unwrap();
        assert_eq!(decoded, vb);
    }

    #[test]
    fn varbind_list_consumes_exactly() {
        let vbs = vec![
            VarBind::new(oid("1.3.6.1.1"), Value::OctetString(b"abc".to_vec())),
            VarBind::new(oid("1.3.6.1.2"), Value::Counter64(7)),
            VarBind::new(oid("1.3.6.1.10"), Value::EndOfMibView),
        ];
        let mut buf = Vec::new();
        for vb in &vbs {
            encode_varbind(&mut buf, vb, ByteOrder::Little);
        }
        let decoded = Decoder::new(&buf, ByteOrder::Little).varbind_list().unwrap();
        assert_eq!(decoded, vbs);
    }

    #[test]
    fn payload_length_is_patched() {
        let header = Header::new(PduType::Open, 0, 0, 1);
        let frame = encode_open(&header, 30, "test agent");
        let decoded = Header::decode(&frame).unwrap();
        assert_eq!(decoded.payload_length as usize, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn open_frame_shape() {
        let frame = encode_open(&Header::new(PduType::Open, 0, 0, 1), 5, "x");
        // header + (timeout+reserved) + null OID + octet string "x"
        assert_eq!(frame.len(), HEADER_SIZE + 4 + 4 + 8);
        assert_eq!(frame[HEADER_SIZE], 5);
    }

    #[test]
    fn close_frame_shape() {
        let frame = encode_close(&Header::new(PduType::Close, 7, 0, 2), CloseReason::Shutdown);
        assert_eq!(frame.len(), HEADER_SIZE + 4);
        assert_eq!(frame[HEADER_SIZE], CloseReason::Shutdown as u8);
    }

    #[test]
    fn register_roundtrip_fields() {
        let subtree = oid("1.3.6.1.4.1.12345");
        let frame = encode_register(
            &Header::new(PduType::Register, 7, 0, 2),
            None,
            5,
            127,
            &subtree,
        );
        let header = Header::decode(&frame).unwrap();
        assert_eq!(header.pdu_type, PduType::Register);

        let mut dec = Decoder::new(&frame[HEADER_SIZE..], header.byte_order());
        assert_eq!(dec.u8().unwrap(), 5); // timeout
        assert_eq!(dec.u8().unwrap(), 127); // priority
        assert_eq!(dec.u8().unwrap(), 0); // range_subid
        dec.u8().unwrap();
        let (decoded, _) = dec.oid().unwrap();
        assert_eq!(decoded, Some(subtree));
    }

    #[test]
    fn register_with_context_sets_flag() {
        let frame = encode_register(
            &Header::new(PduType::Register, 7, 0, 2),
            Some("backup"),
            5,
            127,
            &oid("1.3.6.1"),
        );
        let header = Header::decode(&frame).unwrap();
        assert!(header.flags.contains(Flags::NON_DEFAULT_CONTEXT));
        let mut dec = Decoder::new(&frame[HEADER_SIZE..], header.byte_order());
        assert_eq!(dec.octet_string().unwrap(), b"backup");
    }

    #[test]
    fn get_body_roundtrip() {
        let mut header = Header::new(PduType::GetNext, 7, 3, 9);
        let mut body = Vec::new();
        encode_search_range(
            &mut body,
            &SearchRange::new(oid("1.3.6.1.2.1"), Some(oid("1.3.6.1.2.2")), true),
            header.byte_order(),
        );
        encode_search_range(
            &mut body,
            &SearchRange::new(oid("1.3.6.1.9"), None, false),
            header.byte_order(),
        );
        header.payload_length = body.len() as u32;

        let decoded = decode_get(&header, &body).unwrap();
        assert_eq!(decoded.context, None);
        assert_eq!(decoded.ranges.len(), 2);
        assert_eq!(decoded.ranges[0].start, oid("1.3.6.1.2.1"));
        assert_eq!(decoded.ranges[0].end, Some(oid("1.3.6.1.2.2")));
        assert!(decoded.ranges[0].include);
        assert_eq!(decoded.ranges[1].end, None);
        assert!(!decoded.ranges[1].include);
    }

    #[test]
    fn get_body_with_context() {
        let mut header = Header::new(PduType::Get, 7, 3, 9);
        header.flags |= Flags::NON_DEFAULT_CONTEXT;
        let order = header.byte_order();

        let mut body = Vec::new();
        encode_octet_string(&mut body, b"ctx1", order);
        encode_search_range(
            &mut body,
            &SearchRange::new(oid("1.3.6.1.1.0"), None, false),
            order,
        );

        let decoded = decode_get(&header, &body).unwrap();
        assert_eq!(decoded.context.as_deref(), Some("ctx1"));
        assert_eq!(decoded.ranges.len(), 1);
    }

    #[test]
    fn getbulk_body_roundtrip() {
        let header = Header::new(PduType::GetBulk, 7, 3, 9);
        let order = header.byte_order();

        let mut body = Vec::new();
        encode_u16(&mut body, 1, order);
        encode_u16(&mut body, 10, order);
        encode_search_range(
            &mut body,
            &SearchRange::new(oid("1.3.6.1.2.1.1"), None, false),
            order,
        );

        let decoded = decode_getbulk(&header, &body).unwrap();
        assert_eq!(decoded.non_repeaters, 1);
        assert_eq!(decoded.max_repetitions, 10);
        assert_eq!(decoded.ranges.len(), 1);
    }

    #[test]
    fn testset_body_roundtrip() {
        let header = Header::new(PduType::TestSet, 7, 3, 9);
        let order = header.byte_order();

        let mut body = Vec::new();
        encode_varbind(
            &mut body,
            &VarBind::new(oid("1.3.6.1.2.1.1.1.0"), Value::Integer(42)),
            order,
        );

        let decoded = decode_testset(&header, &body).unwrap();
        assert_eq!(decoded.varbinds.len(), 1);
        assert_eq!(decoded.varbinds[0].value, Value::Integer(42));
    }

    #[test]
    fn response_roundtrip() {
        let inbound = Header::new(PduType::Get, 7, 3, 9);
        let vbs = vec![VarBind::new(oid("1.3.6.1.1.0"), Value::Gauge32(17))];
        let frame = encode_response(&inbound, 0, NO_ERROR, 0, &vbs, false);

        let header = Header::decode(&frame).unwrap();
        assert_eq!(header.pdu_type, PduType::Response);
        assert_eq!(header.session_id, 7);
        assert_eq!(header.transaction_id, 3);
        assert_eq!(header.packet_id, 9);

        let body = decode_response(&header, &frame[HEADER_SIZE..]).unwrap();
        assert!(!body.is_error());
        assert_eq!(body.varbinds, vbs);
    }

    #[test]
    fn response_error_fields() {
        let inbound = Header::new(PduType::TestSet, 7, 3, 9);
        let frame = encode_response(&inbound, 0, NOT_WRITABLE, 2, &[], false);
        let header = Header::decode(&frame).unwrap();
        let body = decode_response(&header, &frame[HEADER_SIZE..]).unwrap();
        assert!(body.is_error());
        assert_eq!(body.error, NOT_WRITABLE);
        assert_eq!(body.index, 2);
    }

    #[test]
    fn short_body_is_protocol_error() {
        let header = Header::new(PduType::Response, 1, 1, 1);
        assert!(matches!(
            decode_response(&header, &[0, 0, 0]),
            Err(Error::Protocol(_))
        ));
    }
}
