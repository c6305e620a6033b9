//! Deferred table slots
//!
//! A [`TableIndexProxy`] names one slot, `table[key]`, without reading it.
//! The key is anchored for as long as the proxy lives; the table is
//! borrowed from the handle that produced the proxy, so no extra anchor is
//! taken for it.

use tracing::trace;

use crate::anchor::Anchor;
use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::value::{ValueHandle, index_get, index_set};

/// A reference to the slot `table[key]`.
///
/// A default proxy has no context and fails every operation with
/// [`Error::InvalidHandle`]. A proxy created with [`unbound`] has a key
/// but no table and fails with [`Error::NotBoundToTable`].
///
/// [`unbound`]: TableIndexProxy::unbound
#[derive(Debug, Default)]
pub struct TableIndexProxy<'h, 'lua> {
    context: Option<&'lua RuntimeContext>,
    table: Option<&'h Anchor<'lua>>,
    key: Option<Anchor<'lua>>,
}

impl<'h, 'lua> TableIndexProxy<'h, 'lua> {
    pub(crate) fn new(table: &'h Anchor<'lua>, key: &ValueHandle<'_>) -> Result<Self> {
        let context = table.context();
        let key = anchor_key(context, key)?;
        Ok(TableIndexProxy {
            context: Some(context),
            table: Some(table),
            key: Some(key),
        })
    }

    /// A proxy for `key` that is not attached to any table.
    pub fn unbound(context: &'lua RuntimeContext, key: &ValueHandle<'_>) -> Result<Self> {
        let key = anchor_key(context, key)?;
        Ok(TableIndexProxy {
            context: Some(context),
            table: None,
            key: Some(key),
        })
    }

    pub fn context(&self) -> Option<&'lua RuntimeContext> {
        self.context
    }

    pub fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    fn parts(&self) -> Result<(&'h Anchor<'lua>, &Anchor<'lua>)> {
        let (Some(_), Some(key)) = (self.context, &self.key) else {
            return Err(Error::InvalidHandle("proxy has no context"));
        };
        let table = self.table.ok_or(Error::NotBoundToTable)?;
        Ok((table, key))
    }

    /// The key this proxy indexes with.
    pub fn key(&self) -> Result<ValueHandle<'lua>> {
        let key = self
            .key
            .as_ref()
            .ok_or(Error::InvalidHandle("proxy has no context"))?;
        let context = key.context();
        context.state().push_ref(key.id());
        Ok(ValueHandle::anchored_top(context))
    }

    /// Reads the current contents of the slot.
    pub fn get(&self) -> Result<ValueHandle<'lua>> {
        let (table, key) = self.parts()?;
        index_get(table, key)
    }

    /// Stores `value` into the slot.
    pub fn set<V>(&self, value: V) -> Result<()>
    where
        V: Into<ValueHandle<'lua>>,
    {
        let (table, key) = self.parts()?;
        let value = value.into();
        if let Some(context) = self.context {
            value.check_context(context)?;
        }
        trace!(table = table.id(), key = key.id(), "write through proxy");
        index_set(table, key, &value)
    }
}

fn anchor_key<'lua>(context: &'lua RuntimeContext, key: &ValueHandle<'_>) -> Result<Anchor<'lua>> {
    key.check_context(context)?;
    key.push_into(context)?;
    Ok(context.anchor_top())
}

/// Re-anchors the key under a fresh id; the table is shared.
impl Clone for TableIndexProxy<'_, '_> {
    fn clone(&self) -> Self {
        TableIndexProxy {
            context: self.context,
            table: self.table,
            key: self.key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_write_through_proxy() {
        let ctx = RuntimeContext::new();
        let t = ctx.create_table(0, 0);
        let slot = t.index("answer").unwrap();
        assert!(slot.get().unwrap().is_nil());

        slot.set(42).unwrap();
        assert_eq!(slot.get().unwrap().to_integer(), 42);
        assert_eq!(t.table_get("answer").unwrap().to_integer(), 42);
        assert_eq!(ctx.stack_depth(), 0);
    }

    #[test]
    fn test_proxy_anchors_only_the_key() {
        let ctx = RuntimeContext::new();
        let t = ctx.create_table(0, 0);
        assert_eq!(ctx.live_anchors(), 1);

        let slot = t.index(1).unwrap();
        assert_eq!(ctx.live_anchors(), 2);

        let copy = slot.clone();
        assert_eq!(ctx.live_anchors(), 3);

        copy.set("via copy").unwrap();
        assert_eq!(slot.get().unwrap().to_string_lossy(), "via copy");

        drop(copy);
        drop(slot);
        assert_eq!(ctx.live_anchors(), 1);
    }

    #[test]
    fn test_access_reuses_the_key_anchor() {
        let ctx = RuntimeContext::new();
        let t = ctx.create_table(0, 0);
        let slot = t.index(ctx.string("counter")).unwrap();
        let before = ctx.anchor_stats();

        for i in 0..10 {
            slot.set(i).unwrap();
            assert_eq!(slot.get().unwrap().to_integer(), i);
        }
        let after = ctx.anchor_stats();
        assert_eq!(after.created, before.created);
        assert_eq!(after.live, before.live);
    }

    #[test]
    fn test_default_proxy_is_invalid() {
        let proxy = TableIndexProxy::default();
        assert!(!proxy.is_valid());
        assert!(matches!(proxy.get(), Err(Error::InvalidHandle(_))));
        assert!(matches!(proxy.set(1), Err(Error::InvalidHandle(_))));
        assert!(matches!(proxy.key(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_unbound_proxy_rejects_access() {
        let ctx = RuntimeContext::with_config(Default::default());
        let proxy = TableIndexProxy::unbound(&ctx, &"name".into()).unwrap();
        assert_eq!(proxy.get().unwrap_err(), Error::NotBoundToTable);
        assert_eq!(proxy.set(1).unwrap_err(), Error::NotBoundToTable);
        assert_eq!(proxy.key().unwrap().to_string_lossy(), "name");
        assert!(ctx.get_global("name").is_nil());
    }

    #[test]
    fn test_write_rejects_foreign_value() {
        let a = RuntimeContext::new();
        let b = RuntimeContext::new();
        let t = a.create_table(0, 0);
        let slot = t.index(1).unwrap();
        let foreign = b.create_table(0, 0);
        assert_eq!(slot.set(&foreign).unwrap_err(), Error::CrossContext);
        assert!(slot.get().unwrap().is_nil());
        assert_eq!(a.stack_depth(), 0);
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let a = RuntimeContext::new();
        let b = RuntimeContext::new();
        let t = a.create_table(0, 0);
        let key = b.string("k");
        assert_eq!(t.index(&key).unwrap_err(), Error::CrossContext);
    }
}
