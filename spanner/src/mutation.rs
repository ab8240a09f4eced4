use prost_types::{ListValue, Value};

use crate::apiv1::rpc::{Mutation, Write};
use crate::key::KeySet;
use crate::statement::ToKind;

fn write(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Write {
    let values = values
        .iter()
        .map(|x| Value {
            kind: Some(x.to_kind()),
        })
        .collect();

    Write {
        table: table.to_string(),
        columns: columns.iter().map(|x| x.to_string()).collect(),
        values: vec![ListValue { values }],
    }
}

fn write_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Write {
    let mut columns = Vec::with_capacity(columns_and_values.len());
    let mut values = Vec::with_capacity(columns_and_values.len());
    columns_and_values.iter().for_each(|x| {
        columns.push(x.0.to_string());
        values.push(Value {
            kind: Some(x.1.to_kind()),
        })
    });
    Write {
        table: table.to_string(),
        columns,
        values: vec![ListValue { values }],
    }
}

/// Insert returns a Mutation to insert a row into a table. If the row already
/// exists, the write or transaction fails with codes.AlreadyExists.
pub fn insert(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    Mutation::Insert(write(table, columns, values))
}

/// insert_map returns a Mutation to insert a row into a table, specified by
/// a map of column name to value.
pub fn insert_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    Mutation::Insert(write_map(table, columns_and_values))
}

/// Update returns a Mutation to update a row in a table. If the row does not
/// already exist, the write or transaction fails.
pub fn update(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    Mutation::Update(write(table, columns, values))
}

pub fn update_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    Mutation::Update(write_map(table, columns_and_values))
}

/// Replace returns a Mutation to insert a row into a table, deleting any
/// existing row. Unlike InsertOrUpdate, this means any values not explicitly
/// written become NULL.
pub fn replace(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    Mutation::Replace(write(table, columns, values))
}

/// InsertOrUpdate returns a Mutation to insert a row into a table. If the row
/// already exists, it updates it instead. Any column values not explicitly
/// written are preserved.
pub fn insert_or_update(table: &str, columns: &[&str], values: &[&dyn ToKind]) -> Mutation {
    Mutation::InsertOrUpdate(write(table, columns, values))
}

pub fn insert_or_update_map(table: &str, columns_and_values: &[(&str, &dyn ToKind)]) -> Mutation {
    Mutation::InsertOrUpdate(write_map(table, columns_and_values))
}

/// delete removes the rows described by the KeySet from the table. It succeeds
/// whether or not the keys were present.
pub fn delete(table: &str, key_set: impl Into<KeySet>) -> Mutation {
    Mutation::Delete {
        table: table.to_string(),
        key_set: key_set.into().inner,
    }
}

#[cfg(test)]
mod tests {
    use prost_types::value::Kind;

    use crate::apiv1::rpc::Mutation;
    use crate::key::{all_keys, Key};
    use crate::mutation::{delete, insert, insert_or_update_map, replace, update};

    #[test]
    fn test_insert() {
        match insert("Guild", &["GuildId", "Level"], &[&"g1", &10i64]) {
            Mutation::Insert(w) => {
                assert_eq!(w.table, "Guild");
                assert_eq!(w.columns, vec!["GuildId", "Level"]);
                assert_eq!(w.values.len(), 1);
                assert_eq!(
                    w.values[0].values[1].kind,
                    Some(Kind::StringValue("10".to_string()))
                );
            }
            _ => panic!("invalid mutation"),
        }
    }

    #[test]
    fn test_other_writes() {
        assert!(matches!(update("Guild", &["GuildId"], &[&"g1"]), Mutation::Update(_)));
        assert!(matches!(replace("Guild", &["GuildId"], &[&"g1"]), Mutation::Replace(_)));
        match insert_or_update_map("Guild", &[("GuildId", &"g1"), ("Active", &true)]) {
            Mutation::InsertOrUpdate(w) => assert_eq!(w.columns, vec!["GuildId", "Active"]),
            _ => panic!("invalid mutation"),
        }
    }

    #[test]
    fn test_delete() {
        match delete("Guild", Key::one("g1")) {
            Mutation::Delete { table, key_set } => {
                assert_eq!(table, "Guild");
                assert_eq!(key_set.keys.len(), 1);
            }
            _ => panic!("invalid mutation"),
        }
        match delete("Guild", all_keys()) {
            Mutation::Delete { key_set, .. } => assert!(key_set.all),
            _ => panic!("invalid mutation"),
        }
    }
}
