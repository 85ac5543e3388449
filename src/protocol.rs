//! The wire side of the subagent: one stream to the master, framing,
//! session lifecycle, and request/response correlation.
//!
//! The stream lives behind an `RwLock` with concurrent readers allowed
//! (`&UnixStream` implements `Read`/`Write`); writes are serialized by a
//! dedicated mutex so a trap from an updater thread never interleaves with
//! a response frame.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::pdu::{
    self, CloseReason, Header, PduType, ResponseBody, HEADER_SIZE,
};
use crate::value::VarBind;

/// Stream to the master agent. The default transport is the UNIX-domain
/// socket at `/var/agentx/master`; a `host:port` socket path selects
/// AgentX-over-TCP (net-snmp masters commonly listen on `localhost:705`).
pub enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    pub fn connect(address: &str) -> io::Result<Self> {
        if address.contains('/') || !address.contains(':') {
            Ok(Transport::Unix(UnixStream::connect(address)?))
        } else {
            Ok(Transport::Tcp(TcpStream::connect(address)?))
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Transport::Unix(s) => s.set_read_timeout(timeout),
            Transport::Tcp(s) => s.set_read_timeout(timeout),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(s) => {
                let mut s: &UnixStream = s;
                s.read(buf)
            }
            Transport::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.read(buf)
            }
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Unix(s) => {
                let mut s: &UnixStream = s;
                s.write_all(buf)
            }
            Transport::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.write_all(buf)
            }
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }
}

#[derive(Default)]
struct RecvState {
    /// Byte accumulator; a partial PDU survives across `recv_pdu` calls.
    buf: Vec<u8>,
    /// Inbound PDUs that arrived while a reply was being awaited. Drained
    /// by `recv_pdu` before the socket is touched again.
    pending: VecDeque<(Header, Vec<u8>)>,
    /// Packet ids with an in-flight request. Whichever thread drains the
    /// socket routes Responses for these to `replies` instead of handing
    /// them to the dispatch loop.
    awaited: std::collections::HashSet<u32>,
    replies: std::collections::HashMap<u32, (Header, Vec<u8>)>,
}

pub struct Protocol {
    agent_id: String,
    socket_path: String,
    timeout: Duration,
    parallel_encoding: bool,
    stream: RwLock<Option<Transport>>,
    write_lock: Mutex<()>,
    recv: Mutex<RecvState>,
    session_id: AtomicU32,
    transaction_id: AtomicU32,
    packet_id: AtomicU32,
}

impl Protocol {
    pub fn new(agent_id: &str, socket_path: &str, timeout: Duration, parallel_encoding: bool) -> Self {
        Protocol {
            agent_id: agent_id.to_string(),
            socket_path: socket_path.to_string(),
            timeout,
            parallel_encoding,
            stream: RwLock::new(None),
            write_lock: Mutex::new(()),
            recv: Mutex::new(RecvState::default()),
            session_id: AtomicU32::new(0),
            transaction_id: AtomicU32::new(0),
            packet_id: AtomicU32::new(0),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::SeqCst)
    }

    fn next_packet_id(&self) -> u32 {
        self.packet_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_transaction_id(&self) -> u32 {
        self.transaction_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Session timeout in whole seconds, as carried in Open and Register.
    fn timeout_byte(&self) -> u8 {
        self.timeout.as_secs().min(255) as u8
    }

    pub fn connect(&self) -> Result<()> {
        debug!("connect: connecting to master at {}", self.socket_path);
        let transport = Transport::connect(&self.socket_path).map_err(|e| {
            Error::Connection(format!("failed to connect to {}: {}", self.socket_path, e))
        })?;
        *self.stream.write().unwrap() = Some(transport);
        Ok(())
    }

    /// Take over an already-connected stream. Test harnesses use this to
    /// speak to a socketpair peer.
    #[cfg(test)]
    pub(crate) fn attach(&self, transport: Transport) {
        *self.stream.write().unwrap() = Some(transport);
    }

    /// Close the stream and forget all buffered state. Safe to call twice.
    pub fn disconnect(&self) {
        if let Some(transport) = self.stream.read().unwrap().as_ref() {
            transport.shutdown();
        }
        *self.stream.write().unwrap() = None;

        let mut recv = self.recv.lock().unwrap();
        recv.buf.clear();
        recv.pending.clear();
    }

    pub fn send(&self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.read().unwrap();
        let transport = stream
            .as_ref()
            .ok_or_else(|| Error::Session("not connected".to_string()))?;

        let _serialized = self.write_lock.lock().unwrap();
        transport
            .write_all(frame)
            .map_err(|e| Error::Connection(format!("send failed: {}", e)))
    }

    /// Read one inbound PDU, waiting up to `timeout`. `None` means nothing
    /// complete arrived in time; a partial PDU stays buffered for the next
    /// call. EOF, even mid-PDU, is a connection error.
    pub fn recv_pdu(&self, timeout: Duration) -> Result<Option<(Header, Vec<u8>)>> {
        self.pump(timeout, None)
    }

    /// The single socket drain. With `want == None` it serves the dispatch
    /// loop: queued inbound PDUs first, then whatever the socket yields,
    /// except Responses some other thread is waiting on, which are routed
    /// to the `replies` table. With `want == Some(pid)` it serves a
    /// requester: inbound requests get parked on the pending queue, stale
    /// Responses are dropped, and only the reply for `pid` is returned.
    fn pump(&self, timeout: Duration, want: Option<u32>) -> Result<Option<(Header, Vec<u8>)>> {
        let mut recv = self.recv.lock().unwrap();
        let deadline = Instant::now() + timeout;

        loop {
            match want {
                Some(pid) => {
                    // another thread may have drained our reply already
                    if let Some(reply) = recv.replies.remove(&pid) {
                        return Ok(Some(reply));
                    }
                }
                None => {
                    if let Some(pdu) = recv.pending.pop_front() {
                        return Ok(Some(pdu));
                    }
                }
            }

            if recv.buf.len() >= HEADER_SIZE {
                let header = Header::decode(&recv.buf[..HEADER_SIZE])?;
                let need = HEADER_SIZE + header.payload_length as usize;
                if recv.buf.len() >= need {
                    let frame: Vec<u8> = recv.buf.drain(..need).collect();
                    let body = frame[HEADER_SIZE..].to_vec();
                    trace!(
                        "pump: {:?}, sid {}, tid {}, pid {}, {} payload bytes",
                        header.pdu_type,
                        header.session_id,
                        header.transaction_id,
                        header.packet_id,
                        header.payload_length
                    );

                    if header.pdu_type == PduType::Response {
                        match want {
                            Some(pid) if header.packet_id == pid => {
                                return Ok(Some((header, body)))
                            }
                            _ if recv.awaited.contains(&header.packet_id) => {
                                recv.replies.insert(header.packet_id, (header, body));
                                continue;
                            }
                            Some(_) => {
                                debug!(
                                    "pump: dropping stale response for packet {}",
                                    header.packet_id
                                );
                                continue;
                            }
                            None => return Ok(Some((header, body))),
                        }
                    }

                    match want {
                        None => return Ok(Some((header, body))),
                        Some(_) => {
                            if self.session_id() == 0 {
                                // nothing but the reply is legitimate
                                // before the session exists
                                return Err(Error::Protocol(format!(
                                    "expected Response, got {:?}",
                                    header.pdu_type
                                )));
                            }
                            trace!(
                                "pump: parking inbound {:?} while awaiting a reply",
                                header.pdu_type
                            );
                            recv.pending.push_back((header, body));
                            continue;
                        }
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let stream = self.stream.read().unwrap();
            let transport = stream
                .as_ref()
                .ok_or_else(|| Error::Session("not connected".to_string()))?;
            transport.set_read_timeout(Some(remaining))?;

            let mut chunk = [0u8; 4096];
            match transport.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Connection(
                        "connection closed by master".to_string(),
                    ))
                }
                Ok(n) => recv.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Connection(format!("receive failed: {}", e))),
            }
        }
    }

    /// Send a frame and wait for its Response, correlated by packet id.
    /// `None` on timeout.
    fn transact(&self, frame: &[u8], packet_id: u32) -> Result<Option<(Header, ResponseBody)>> {
        // announce interest before sending so a racing drain parks the
        // reply instead of discarding it
        self.recv.lock().unwrap().awaited.insert(packet_id);
        let result = self.transact_inner(frame, packet_id);

        let mut recv = self.recv.lock().unwrap();
        recv.awaited.remove(&packet_id);
        recv.replies.remove(&packet_id);
        result
    }

    fn transact_inner(
        &self,
        frame: &[u8],
        packet_id: u32,
    ) -> Result<Option<(Header, ResponseBody)>> {
        self.send(frame)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.pump(remaining, Some(packet_id))? {
                Some((header, body)) => {
                    let resp = pdu::decode_response(&header, &body)?;
                    return Ok(Some((header, resp)));
                }
                None => return Ok(None),
            }
        }
    }

    /// Open the session: the session id assigned by the master is taken
    /// from the Response header and used for everything that follows.
    pub fn open_session(&self) -> Result<()> {
        let packet_id = self.next_packet_id();
        let header = Header::new(PduType::Open, 0, 0, packet_id);
        let frame = pdu::encode_open(&header, self.timeout_byte(), &self.agent_id);

        match self.transact(&frame, packet_id)? {
            None => Err(Error::Connection("no response to Open".to_string())),
            Some((_, resp)) if resp.is_error() => Err(Error::Connection(format!(
                "Open failed: error {}",
                resp.error
            ))),
            Some((reply, _)) => {
                self.session_id.store(reply.session_id, Ordering::SeqCst);
                info!("open_session: session {} established", reply.session_id);
                Ok(())
            }
        }
    }

    /// Tell the master we are going away. No-op without a session; the
    /// master's acknowledgement is not awaited since the stream is torn
    /// down right after.
    pub fn close_session(&self) -> Result<()> {
        let session_id = self.session_id.swap(0, Ordering::SeqCst);
        if session_id == 0 {
            return Ok(());
        }

        debug!("close_session: closing session {}", session_id);
        let header = Header::new(PduType::Close, session_id, 0, self.next_packet_id());
        self.send(&pdu::encode_close(&header, CloseReason::Shutdown))
    }

    /// Liveness probe: Ping must come back as a Response within the
    /// configured timeout.
    pub fn ping(&self) -> Result<()> {
        let session_id = self.session_id();
        if session_id == 0 {
            return Err(Error::Session("no open session".to_string()));
        }

        let packet_id = self.next_packet_id();
        let header = Header::new(PduType::Ping, session_id, 0, packet_id);
        match self.transact(&pdu::encode_ping(&header, None), packet_id)? {
            Some(_) => Ok(()),
            None => Err(Error::Connection("no response to Ping".to_string())),
        }
    }

    /// Claim a subtree with the master.
    pub fn register_oid(
        &self,
        subtree: &Oid,
        priority: u8,
        context: Option<&str>,
    ) -> Result<()> {
        let session_id = self.session_id();
        if session_id == 0 {
            return Err(Error::Session("no open session".to_string()));
        }

        debug!(
            "register_oid: registering {} (priority {}, context {:?})",
            subtree, priority, context
        );
        let packet_id = self.next_packet_id();
        let header = Header::new(PduType::Register, session_id, 0, packet_id);
        let frame = pdu::encode_register(&header, context, self.timeout_byte(), priority, subtree);

        match self.transact(&frame, packet_id)? {
            None => Err(Error::Registration(format!(
                "no response registering {}",
                subtree
            ))),
            Some((_, resp)) if resp.is_error() => Err(Error::Registration(format!(
                "registration of {} failed: error {}",
                subtree, resp.error
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Release a previously claimed subtree.
    pub fn unregister_oid(&self, subtree: &Oid, priority: u8, context: Option<&str>) -> Result<()> {
        let session_id = self.session_id();
        if session_id == 0 {
            return Err(Error::Session("no open session".to_string()));
        }

        debug!("unregister_oid: releasing {}", subtree);
        let packet_id = self.next_packet_id();
        let header = Header::new(PduType::Unregister, session_id, 0, packet_id);
        let frame = pdu::encode_unregister(&header, context, priority, subtree);

        match self.transact(&frame, packet_id)? {
            None => Err(Error::Registration(format!(
                "no response unregistering {}",
                subtree
            ))),
            Some((_, resp)) if resp.is_error() => Err(Error::Registration(format!(
                "unregistration of {} failed: error {}",
                subtree, resp.error
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Answer an inbound PDU, echoing its session, transaction and packet
    /// ids.
    pub fn send_response(
        &self,
        inbound: &Header,
        varbinds: &[VarBind],
        error: u16,
        index: u16,
        sys_uptime: u32,
    ) -> Result<()> {
        let frame = pdu::encode_response(
            inbound,
            sys_uptime,
            error,
            index,
            varbinds,
            self.parallel_encoding,
        );
        self.send(&frame)
    }

    /// Push a notification with fresh transaction and packet ids.
    pub fn send_notify(&self, varbinds: &[VarBind], context: Option<&str>) -> Result<()> {
        let session_id = self.session_id();
        if session_id == 0 {
            return Err(Error::Session("no open session".to_string()));
        }

        let header = Header::new(
            PduType::Notify,
            session_id,
            self.next_transaction_id(),
            self.next_packet_id(),
        );
        self.send(&pdu::encode_notify(&header, context, varbinds))
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        if let Some(transport) = self.stream.read().unwrap().as_ref() {
            transport.shutdown();
        }
    }
}
