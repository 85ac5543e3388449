//! Application-side data sources.
//!
//! An [`Updater`] is the hook through which an application publishes a MIB
//! subtree. The agent calls `update()` on a timer; the implementation stages
//! typed values keyed by OID suffix into the passed [`Snapshot`], and the
//! agent then publishes the whole snapshot as one atomic subtree
//! replacement. Readers never observe a half-written refresh because
//! `update()` itself never touches the live store.

use std::collections::BTreeMap;

use crate::agent::AgentHandle;
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::value::{Value, VarBind};

/// Staged values for one subtree refresh, keyed by OID suffix relative to
/// the registration's base OID.
#[derive(Debug, Default)]
pub struct Snapshot {
    values: BTreeMap<Oid, Value>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot::default()
    }

    /// Drop everything staged so far. A refresh that enumerates its world
    /// from scratch calls this first; the agent also hands every `update()`
    /// a cleared snapshot, so this mainly matters for implementations that
    /// stage across helper calls.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, suffix: &str) -> Option<&Value> {
        let oid: Oid = suffix.parse().ok()?;
        self.values.get(&oid)
    }

    fn set(&mut self, suffix: &str, value: Value) -> Result<()> {
        let oid: Oid = suffix.parse()?;
        self.values.insert(oid, value);
        Ok(())
    }

    pub fn set_integer(&mut self, suffix: &str, value: i32) -> Result<()> {
        self.set(suffix, Value::Integer(value))
    }

    /// Accepts both text (`&str`, staged as UTF-8) and raw bytes.
    pub fn set_octet_string(&mut self, suffix: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.set(suffix, Value::OctetString(value.into()))
    }

    pub fn set_null(&mut self, suffix: &str) -> Result<()> {
        self.set(suffix, Value::Null)
    }

    pub fn set_object_identifier(&mut self, suffix: &str, value: &str) -> Result<()> {
        let oid: Oid = value.parse()?;
        self.set(suffix, Value::ObjectIdentifier(oid))
    }

    /// Parses a dotted quad; anything else is rejected.
    pub fn set_ip_address(&mut self, suffix: &str, addr: &str) -> Result<()> {
        let addr: std::net::Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidOid(format!("invalid IPv4 address: {}", addr)))?;
        self.set(suffix, Value::IpAddress(addr.octets()))
    }

    pub fn set_counter32(&mut self, suffix: &str, value: u32) -> Result<()> {
        self.set(suffix, Value::Counter32(value))
    }

    pub fn set_gauge32(&mut self, suffix: &str, value: u32) -> Result<()> {
        self.set(suffix, Value::Gauge32(value))
    }

    pub fn set_time_ticks(&mut self, suffix: &str, value: u32) -> Result<()> {
        self.set(suffix, Value::TimeTicks(value))
    }

    pub fn set_opaque(&mut self, suffix: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.set(suffix, Value::Opaque(value.into()))
    }

    pub fn set_counter64(&mut self, suffix: &str, value: u64) -> Result<()> {
        self.set(suffix, Value::Counter64(value))
    }

    /// The staged values as varbinds under `base`, in OID order.
    pub fn varbinds(&self, base: &Oid) -> Vec<VarBind> {
        self.values
            .iter()
            .map(|(suffix, value)| VarBind::new(base.join(suffix), value.clone()))
            .collect()
    }
}

/// A periodic data source for one registered subtree.
///
/// Implementations stage values into the snapshot; publication happens in
/// the agent after `update()` returns. Errors are logged and the stale
/// subtree stays live until the next successful refresh.
pub trait Updater: Send {
    /// Called once when the updater is registered. Implementations that
    /// send traps keep the handle; everyone else can ignore it.
    fn attach(&mut self, _agent: AgentHandle) {}

    fn update(&mut self, snapshot: &mut Snapshot) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(s: &str) -> Oid {
        s.parse().unwrap()
    }

    #[test]
    fn typed_setters_stage_values() {
        let mut snap = Snapshot::new();
        snap.set_integer("1.0", -12345).unwrap();
        snap.set_octet_string("2.0", "héllo").unwrap();
        snap.set_octet_string("3.0", b"raw".to_vec()).unwrap();
        snap.set_counter32("4.0", u32::MAX).unwrap();
        snap.set_gauge32("5.0", 1_000_000).unwrap();
        snap.set_time_ticks("6.0", 123_456_789).unwrap();
        snap.set_opaque("7.0", vec![0, 1, 2, 3]).unwrap();
        snap.set_counter64("8.0", (1 << 63) + 12345).unwrap();
        snap.set_object_identifier("9.0", "1.3.6.1.4.1.12345").unwrap();
        snap.set_ip_address("10.0", "192.168.1.1").unwrap();

        assert_eq!(snap.get("1.0"), Some(&Value::Integer(-12345)));
        assert_eq!(
            snap.get("2.0"),
            Some(&Value::OctetString("héllo".as_bytes().to_vec()))
        );
        assert_eq!(snap.get("8.0"), Some(&Value::Counter64((1 << 63) + 12345)));
        assert_eq!(snap.get("10.0"), Some(&Value::IpAddress([192, 168, 1, 1])));
        assert_eq!(snap.len(), 10);
    }

    #[test]
    fn ip_address_rejects_malformed() {
        let mut snap = Snapshot::new();
        assert!(snap.set_ip_address("1.0", "192.168.1").is_err());
        assert!(snap.set_ip_address("1.0", "not-an-address").is_err());
        assert!(snap.is_empty());
    }

    #[test]
    fn bad_suffix_is_invalid_oid() {
        let mut snap = Snapshot::new();
        assert!(matches!(
            snap.set_integer("1.x", 1),
            Err(Error::InvalidOid(_))
        ));
    }

    #[test]
    fn setters_overwrite() {
        let mut snap = Snapshot::new();
        snap.set_integer("1.0", 42).unwrap();
        snap.set_integer("1.0", 100).unwrap();
        assert_eq!(snap.get("1.0"), Some(&Value::Integer(100)));
        assert_eq!(snap.len(), 1);

        snap.set_octet_string("1.0", "now a string").unwrap();
        assert_eq!(
            snap.get("1.0"),
            Some(&Value::OctetString(b"now a string".to_vec()))
        );
    }

    #[test]
    fn clear_empties_staging() {
        let mut snap = Snapshot::new();
        snap.set_integer("1.0", 42).unwrap();
        snap.set_octet_string("2.0", "test").unwrap();
        snap.clear();
        assert!(snap.is_empty());
    }

    #[test]
    fn varbinds_are_prefixed_and_ordered() {
        let mut snap = Snapshot::new();
        snap.set_integer("10.0", 10).unwrap();
        snap.set_integer("2.0", 2).unwrap();
        snap.set_integer("1.0", 1).unwrap();

        let vbs = snap.varbinds(&oid("1.3.6.1.4.1.12345"));
        let oids: Vec<String> = vbs.iter().map(|vb| vb.oid.to_string()).collect();
        assert_eq!(
            oids,
            [
                "1.3.6.1.4.1.12345.1.0",
                "1.3.6.1.4.1.12345.2.0",
                "1.3.6.1.4.1.12345.10.0"
            ]
        );
    }

    #[test]
    fn empty_snapshot_yields_no_varbinds() {
        assert!(Snapshot::new().varbinds(&oid("1.3.6.1")).is_empty());
    }
}
