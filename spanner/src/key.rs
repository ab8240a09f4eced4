use prost_types::{ListValue, Value};

use crate::apiv1::rpc::{KeyRange, KeyRangeEnd, KeyRangeStart, KeySet as InternalKeySet};
use crate::statement::ToKind;

/// A Key can be either a Cloud Spanner row's primary key or a secondary index
/// key, one value per key column.
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    pub(crate) values: ListValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeySet {
    pub(crate) inner: InternalKeySet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    ClosedClosed,
    ClosedOpen,
    OpenClosed,
    OpenOpen,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Range {
    pub(crate) start: Key,
    pub(crate) end: Key,
    pub kind: RangeKind,
}

/// all_keys returns a KeySet that represents all Keys of a table or an index.
pub fn all_keys() -> KeySet {
    KeySet {
        inner: InternalKeySet {
            keys: vec![],
            ranges: vec![],
            all: true,
        },
    }
}

impl Range {
    pub fn new(start: Key, end: Key, kind: RangeKind) -> Range {
        Range { start, end, kind }
    }
}

impl From<Range> for KeyRange {
    fn from(key_range: Range) -> Self {
        let (start, end) = match key_range.kind {
            RangeKind::ClosedClosed => (
                KeyRangeStart::Closed(key_range.start.values),
                KeyRangeEnd::Closed(key_range.end.values),
            ),
            RangeKind::ClosedOpen => (
                KeyRangeStart::Closed(key_range.start.values),
                KeyRangeEnd::Open(key_range.end.values),
            ),
            RangeKind::OpenClosed => (
                KeyRangeStart::Open(key_range.start.values),
                KeyRangeEnd::Closed(key_range.end.values),
            ),
            RangeKind::OpenOpen => (
                KeyRangeStart::Open(key_range.start.values),
                KeyRangeEnd::Open(key_range.end.values),
            ),
        };
        KeyRange { start, end }
    }
}

impl From<Range> for KeySet {
    fn from(key_range: Range) -> Self {
        KeySet {
            inner: InternalKeySet {
                keys: vec![],
                ranges: vec![key_range.into()],
                all: false,
            },
        }
    }
}

impl Key {
    pub fn new(values: &[&dyn ToKind]) -> Key {
        Key {
            values: ListValue {
                values: values
                    .iter()
                    .map(|x| Value {
                        kind: Some(x.to_kind()),
                    })
                    .collect(),
            },
        }
    }

    /// A key of a table with a single key column.
    pub fn one(value: impl ToKind) -> Key {
        Key::new(&[&value])
    }
}

impl From<Key> for KeySet {
    fn from(key: Key) -> Self {
        KeySet {
            inner: InternalKeySet {
                keys: vec![key.values],
                ranges: vec![],
                all: false,
            },
        }
    }
}

impl From<Vec<Key>> for KeySet {
    fn from(keys: Vec<Key>) -> Self {
        let keys = keys.into_iter().map(|key| key.values).collect();
        KeySet {
            inner: InternalKeySet {
                keys,
                ranges: vec![],
                all: false,
            },
        }
    }
}

impl From<KeySet> for InternalKeySet {
    fn from(key_set: KeySet) -> Self {
        key_set.inner
    }
}
