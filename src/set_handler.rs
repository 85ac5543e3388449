//! Write support: the four-phase SET state machine.
//!
//! The master drives every SET through TestSet, then either CommitSet or
//! UndoSet, then CleanupSet. Applications implement [`SetHandler`]; the
//! library-side [`SetRegistration`] wraps one handler together with the
//! staging table for its subtree, so concurrent transactions from different
//! sessions never share state across registrations.

use anyhow::Result;
use log::debug;

use crate::agent::AgentHandle;
use crate::oid::Oid;
use crate::value::Value;
use std::collections::HashMap;

/// Per-registration write callbacks. Every default accepts, so a handler
/// that only cares about `commit` implements just that.
///
/// An error from `test` rejects the varbind (the master sees
/// `WRONG_VALUE`); errors from the later phases are logged, as the protocol
/// has no way to report them.
pub trait SetHandler: Send {
    /// Called once when the handler is registered.
    fn attach(&mut self, _agent: AgentHandle) {}

    fn test(&mut self, _oid: &Oid, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self, _oid: &Oid, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn undo(&mut self, _oid: &Oid) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self, _oid: &Oid) -> Result<()> {
        Ok(())
    }
}

/// Transactions are keyed by the master's (session, transaction) id pair.
type TransactionKey = (u32, u32);

/// One registered handler plus its open transactions.
pub struct SetRegistration {
    base_oid: Oid,
    context: Option<String>,
    handler: Box<dyn SetHandler>,
    transactions: HashMap<TransactionKey, (Oid, Value)>,
}

impl SetRegistration {
    pub fn new(base_oid: Oid, context: Option<String>, handler: Box<dyn SetHandler>) -> Self {
        SetRegistration {
            base_oid,
            context,
            handler,
            transactions: HashMap::new(),
        }
    }

    pub fn base_oid(&self) -> &Oid {
        &self.base_oid
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// TestSet phase: run the handler's validation and stage the varbind on
    /// success. A repeated TestSet for the same key overwrites the previous
    /// staging, since the master has evidently abandoned that attempt.
    /// Nothing is staged on failure.
    pub fn on_test(
        &mut self,
        session_id: u32,
        transaction_id: u32,
        oid: &Oid,
        value: &Value,
    ) -> Result<()> {
        self.handler.test(oid, value)?;
        self.transactions
            .insert((session_id, transaction_id), (oid.clone(), value.clone()));
        Ok(())
    }

    /// CommitSet phase. A missing transaction is a no-op: this registration
    /// was not part of the transaction being committed.
    pub fn on_commit(&mut self, session_id: u32, transaction_id: u32) -> Result<()> {
        match self.transactions.remove(&(session_id, transaction_id)) {
            Some((oid, value)) => self.handler.commit(&oid, &value),
            None => Ok(()),
        }
    }

    pub fn on_undo(&mut self, session_id: u32, transaction_id: u32) -> Result<()> {
        match self.transactions.remove(&(session_id, transaction_id)) {
            Some((oid, _)) => self.handler.undo(&oid),
            None => Ok(()),
        }
    }

    pub fn on_cleanup(&mut self, session_id: u32, transaction_id: u32) -> Result<()> {
        match self.transactions.remove(&(session_id, transaction_id)) {
            Some((oid, _)) => {
                debug!(
                    "on_cleanup: dropping transaction {}_{} for {}",
                    session_id, transaction_id, oid
                );
                self.handler.cleanup(&oid)
            }
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn open_transactions(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn oid(s: &str) -> Oid {
        s.parse().unwrap()
    }

    /// Records every callback invocation for assertions.
    #[derive(Default)]
    struct LoggingHandler {
        log: Arc<Mutex<Vec<String>>>,
        reject_test: bool,
    }

    impl SetHandler for LoggingHandler {
        fn test(&mut self, oid: &Oid, value: &Value) -> Result<()> {
            if self.reject_test {
                anyhow::bail!("invalid value");
            }
            self.log.lock().unwrap().push(format!("test {} {}", oid, value));
            Ok(())
        }

        fn commit(&mut self, oid: &Oid, value: &Value) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("commit {} {}", oid, value));
            Ok(())
        }

        fn undo(&mut self, oid: &Oid) -> Result<()> {
            self.log.lock().unwrap().push(format!("undo {}", oid));
            Ok(())
        }

        fn cleanup(&mut self, oid: &Oid) -> Result<()> {
            self.log.lock().unwrap().push(format!("cleanup {}", oid));
            Ok(())
        }
    }

    fn registration(reject_test: bool) -> (SetRegistration, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = LoggingHandler {
            log: log.clone(),
            reject_test,
        };
        (
            SetRegistration::new(oid("1.3.6.1"), None, Box::new(handler)),
            log,
        )
    }

    #[test]
    fn successful_set_runs_test_then_commit() {
        let (mut reg, log) = registration(false);

        reg.on_test(1, 1, &oid("1.3.6.1.1.0"), &Value::Integer(42)).unwrap();
        assert_eq!(reg.open_transactions(), 1);

        reg.on_commit(1, 1).unwrap();
        assert_eq!(reg.open_transactions(), 0);

        assert_eq!(
            *log.lock().unwrap(),
            [
                "test 1.3.6.1.1.0 INTEGER: 42",
                "commit 1.3.6.1.1.0 INTEGER: 42"
            ]
        );
    }

    #[test]
    fn failed_set_runs_undo() {
        let (mut reg, log) = registration(false);

        reg.on_test(1, 1, &oid("1.3.6.1.1.0"), &Value::Integer(42)).unwrap();
        reg.on_undo(1, 1).unwrap();

        assert_eq!(reg.open_transactions(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            ["test 1.3.6.1.1.0 INTEGER: 42", "undo 1.3.6.1.1.0"]
        );
    }

    #[test]
    fn cleanup_drops_transaction() {
        let (mut reg, log) = registration(false);

        reg.on_test(1, 2, &oid("1.3.6.1.1.0"), &Value::Integer(100)).unwrap();
        reg.on_cleanup(1, 2).unwrap();

        assert_eq!(reg.open_transactions(), 0);
        assert!(log.lock().unwrap().contains(&"cleanup 1.3.6.1.1.0".to_string()));
    }

    #[test]
    fn rejection_stages_nothing() {
        let (mut reg, log) = registration(true);

        assert!(reg
            .on_test(1, 1, &oid("1.3.6.1.1.0"), &Value::Integer(42))
            .is_err());
        assert_eq!(reg.open_transactions(), 0);
        assert!(log.lock().unwrap().is_empty());

        // nothing to commit later either
        reg.on_commit(1, 1).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn repeated_test_overwrites() {
        let (mut reg, log) = registration(false);

        reg.on_test(1, 1, &oid("1.3.6.1.1.0"), &Value::Integer(1)).unwrap();
        reg.on_test(1, 1, &oid("1.3.6.1.2.0"), &Value::Integer(2)).unwrap();
        assert_eq!(reg.open_transactions(), 1);

        reg.on_commit(1, 1).unwrap();
        assert_eq!(
            log.lock().unwrap().last().unwrap(),
            "commit 1.3.6.1.2.0 INTEGER: 2"
        );
    }

    #[test]
    fn missing_transaction_is_noop() {
        let (mut reg, log) = registration(false);
        reg.on_commit(1, 999).unwrap();
        reg.on_undo(1, 999).unwrap();
        reg.on_cleanup(1, 999).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn transactions_are_keyed_per_session_and_id() {
        let (mut reg, log) = registration(false);

        reg.on_test(1, 1, &oid("1.3.6.1.1.0"), &Value::Integer(11)).unwrap();
        reg.on_test(2, 1, &oid("1.3.6.1.2.0"), &Value::Integer(21)).unwrap();
        reg.on_test(1, 2, &oid("1.3.6.1.3.0"), &Value::Integer(12)).unwrap();
        assert_eq!(reg.open_transactions(), 3);

        reg.on_commit(2, 1).unwrap();
        assert_eq!(reg.open_transactions(), 2);
        assert_eq!(
            log.lock().unwrap().last().unwrap(),
            "commit 1.3.6.1.2.0 INTEGER: 21"
        );
    }

    #[test]
    fn defaults_accept_everything() {
        struct Passive;
        impl SetHandler for Passive {}

        let mut reg = SetRegistration::new(oid("1.3.6.1"), None, Box::new(Passive));
        reg.on_test(1, 1, &oid("1.3.6.1.1.0"), &Value::Integer(1)).unwrap();
        reg.on_commit(1, 1).unwrap();
        reg.on_undo(1, 1).unwrap();
        reg.on_cleanup(1, 1).unwrap();
    }
}
