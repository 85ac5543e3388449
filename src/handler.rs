//! Inbound PDU dispatch: decode, consult the store or the set handlers,
//! answer. One response goes out per inbound PDU before the next is read;
//! the dispatch loop is strictly serial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::pdu::{self, Header, PduType, SearchRange, NOT_WRITABLE, NO_ERROR, WRONG_VALUE};
use crate::protocol::Protocol;
use crate::set_handler::SetRegistration;
use crate::store::DataStore;
use crate::value::{Value, VarBind};

pub type SetHandlerTable = Arc<Mutex<HashMap<String, SetRegistration>>>;

pub struct RequestHandler {
    protocol: Arc<Protocol>,
    store: Arc<DataStore>,
    set_handlers: SetHandlerTable,
}

/// Walk state for one GETBULK repeater.
struct BulkCursor {
    current: Oid,
    end: Option<Oid>,
    include: bool,
    done: bool,
}

impl RequestHandler {
    pub fn new(protocol: Arc<Protocol>, store: Arc<DataStore>, set_handlers: SetHandlerTable) -> Self {
        RequestHandler {
            protocol,
            store,
            set_handlers,
        }
    }

    pub fn dispatch(&self, header: &Header, body: &[u8]) -> Result<()> {
        trace!(
            "dispatch: {:?}, sid {}, tid {}",
            header.pdu_type,
            header.session_id,
            header.transaction_id
        );

        match header.pdu_type {
            PduType::Get => self.handle_get(header, body),
            PduType::GetNext => self.handle_getnext(header, body),
            PduType::GetBulk => self.handle_getbulk(header, body),
            PduType::TestSet => self.handle_testset(header, body),
            PduType::CommitSet => self.handle_commitset(header),
            PduType::UndoSet => self.handle_undoset(header),
            PduType::CleanupSet => self.handle_cleanupset(header),
            PduType::Response => {
                // a pong that was already matched, or a reply the master
                // sent unprompted
                debug!("dispatch: stray response for packet {}", header.packet_id);
                Ok(())
            }
            other => {
                warn!("dispatch: unhandled PDU type {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_get(&self, header: &Header, body: &[u8]) -> Result<()> {
        let body = pdu::decode_get(header, body)?;
        let context = normalize(body.context.as_deref());

        let mut varbinds = Vec::with_capacity(body.ranges.len());
        for range in &body.ranges {
            match self.store.get(&range.start, context) {
                Some(vb) => varbinds.push(vb),
                None => varbinds.push(VarBind::new(range.start.clone(), Value::NoSuchObject)),
            }
        }

        self.protocol
            .send_response(header, &varbinds, NO_ERROR, 0, 0)
    }

    fn handle_getnext(&self, header: &Header, body: &[u8]) -> Result<()> {
        let body = pdu::decode_get(header, body)?;
        let context = normalize(body.context.as_deref());

        let varbinds: Vec<VarBind> = body
            .ranges
            .iter()
            .map(|range| self.next_varbind(range, context))
            .collect();

        self.protocol
            .send_response(header, &varbinds, NO_ERROR, 0, 0)
    }

    /// One GETNEXT step. The include flag means the start itself is an
    /// acceptable answer, so it is probed with an exact lookup first.
    fn next_varbind(&self, range: &SearchRange, context: Option<&str>) -> VarBind {
        let hit = if range.include && self.store.get(&range.start, context).is_some() {
            Some(range.start.clone())
        } else {
            self.store
                .get_next(&range.start, range.end.as_ref(), context)
        };

        match hit.and_then(|oid| self.store.get(&oid, context)) {
            Some(vb) => vb,
            None => VarBind::new(range.start.clone(), Value::EndOfMibView),
        }
    }

    fn handle_getbulk(&self, header: &Header, body: &[u8]) -> Result<()> {
        let body = pdu::decode_getbulk(header, body)?;
        let context = normalize(body.context.as_deref());
        let non_repeaters = body.non_repeaters as usize;

        let mut varbinds = Vec::new();
        for range in body.ranges.iter().take(non_repeaters) {
            varbinds.push(self.next_varbind(range, context));
        }

        let mut cursors: Vec<BulkCursor> = body
            .ranges
            .iter()
            .skip(non_repeaters)
            .map(|range| BulkCursor {
                current: range.start.clone(),
                end: range.end.clone(),
                include: range.include,
                done: false,
            })
            .collect();

        // one repetition across all repeaters per round (RFC 2741 7.2.3.3)
        for _ in 0..body.max_repetitions {
            if cursors.iter().all(|c| c.done) {
                break;
            }
            for cursor in cursors.iter_mut() {
                if cursor.done {
                    continue;
                }
                self.bulk_step(cursor, context, &mut varbinds);
            }
        }

        self.protocol
            .send_response(header, &varbinds, NO_ERROR, 0, 0)
    }

    fn bulk_step(&self, cursor: &mut BulkCursor, context: Option<&str>, out: &mut Vec<VarBind>) {
        let hit = if cursor.include && self.store.get(&cursor.current, context).is_some() {
            Some(cursor.current.clone())
        } else {
            self.store
                .get_next(&cursor.current, cursor.end.as_ref(), context)
        };
        cursor.include = false;

        match hit.and_then(|oid| self.store.get(&oid, context)) {
            Some(vb) => {
                cursor.current = vb.oid.clone();
                out.push(vb);
            }
            None => {
                out.push(VarBind::new(cursor.current.clone(), Value::EndOfMibView));
                cursor.done = true;
            }
        }
    }

    fn handle_testset(&self, header: &Header, body: &[u8]) -> Result<()> {
        let body = pdu::decode_testset(header, body)?;
        let context = normalize(body.context.as_deref());
        let mut table = self.lock_set_handlers()?;

        for (i, vb) in body.varbinds.iter().enumerate() {
            let index = (i + 1) as u16;

            let key = match find_set_handler(&table, &vb.oid, context) {
                Some(key) => key,
                None => {
                    warn!("handle_testset: no handler for {}", vb.oid);
                    return self
                        .protocol
                        .send_response(header, &[], NOT_WRITABLE, index, 0);
                }
            };

            if let Some(reg) = table.get_mut(&key) {
                if let Err(e) =
                    reg.on_test(header.session_id, header.transaction_id, &vb.oid, &vb.value)
                {
                    warn!("handle_testset: {} rejected: {}", vb.oid, e);
                    return self
                        .protocol
                        .send_response(header, &[], WRONG_VALUE, index, 0);
                }
            }
        }

        self.protocol.send_response(header, &[], NO_ERROR, 0, 0)
    }

    fn handle_commitset(&self, header: &Header) -> Result<()> {
        let mut table = self.lock_set_handlers()?;
        for reg in table.values_mut() {
            if let Err(e) = reg.on_commit(header.session_id, header.transaction_id) {
                warn!("handle_commitset: commit for {} failed: {}", reg.base_oid(), e);
            }
        }
        drop(table);
        self.protocol.send_response(header, &[], NO_ERROR, 0, 0)
    }

    fn handle_undoset(&self, header: &Header) -> Result<()> {
        let mut table = self.lock_set_handlers()?;
        for reg in table.values_mut() {
            if let Err(e) = reg.on_undo(header.session_id, header.transaction_id) {
                warn!("handle_undoset: undo for {} failed: {}", reg.base_oid(), e);
            }
        }
        drop(table);
        self.protocol.send_response(header, &[], NO_ERROR, 0, 0)
    }

    fn handle_cleanupset(&self, header: &Header) -> Result<()> {
        let mut table = self.lock_set_handlers()?;
        for reg in table.values_mut() {
            if let Err(e) = reg.on_cleanup(header.session_id, header.transaction_id) {
                warn!(
                    "handle_cleanupset: cleanup for {} failed: {}",
                    reg.base_oid(),
                    e
                );
            }
        }
        drop(table);
        self.protocol.send_response(header, &[], NO_ERROR, 0, 0)
    }

    fn lock_set_handlers(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, SetRegistration>>> {
        self.set_handlers
            .lock()
            .map_err(|_| Error::Session("poisoned set handler table".to_string()))
    }
}

/// An empty context string means the default context.
fn normalize(context: Option<&str>) -> Option<&str> {
    context.filter(|c| !c.is_empty())
}

/// Longest component-boundary prefix match among handlers whose context
/// matches.
fn find_set_handler(
    table: &HashMap<String, SetRegistration>,
    oid: &Oid,
    context: Option<&str>,
) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for (key, reg) in table {
        if reg.context() != context || !reg.base_oid().is_prefix_of(oid) {
            continue;
        }
        let len = reg.base_oid().len();
        if best.map_or(true, |(_, best_len)| len > best_len) {
            best = Some((key, len));
        }
    }
    best.map(|(key, _)| key.clone())
}
