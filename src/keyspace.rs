use crate::{
    Error,
    marshal::{Marshaller, TypeDescriptor},
    protocol::{CqlMetadata, KeyspaceDefinition, TableDefinition},
};

/// A described keyspace, as returned by selecting it on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    definition: KeyspaceDefinition,
}

impl Keyspace {
    pub fn new(definition: KeyspaceDefinition) -> Self {
        Self { definition }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &KeyspaceDefinition {
        &self.definition
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDefinition> {
        self.definition.tables.iter()
    }

    pub fn table(&self, name: &str) -> Result<&TableDefinition, Error> {
        self.tables()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::NotFound {
                why: format!("ColumnFamily or Table '{name}' Not Found"),
            })
    }
}

impl TableDefinition {
    /// Type information for decoding rows read from this table.
    pub fn schema(&self) -> CqlMetadata {
        CqlMetadata {
            name_types: Default::default(),
            value_types: self
                .column_metadata
                .iter()
                .map(|c| (c.name.clone(), c.validation_class.clone()))
                .collect(),
            default_name_type: self.comparator_type.clone(),
            default_value_type: self.default_validation_class.clone(),
        }
    }

    pub fn key_marshaller(&self) -> Marshaller {
        Marshaller::new(TypeDescriptor::parse_opt(self.key_validation_class.as_deref()))
    }

    pub fn column_marshaller(&self) -> Marshaller {
        Marshaller::new(TypeDescriptor::parse_opt(self.comparator_type.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::{marshal::Value, protocol::ColumnDefinition};

    use super::*;

    fn keyspace() -> Keyspace {
        Keyspace::new(KeyspaceDefinition {
            name: "metrics".into(),
            strategy_class: "SimpleStrategy".into(),
            strategy_options: BTreeMap::from([("replication_factor".into(), "1".into())]),
            tables: vec![TableDefinition {
                name: "users".into(),
                key_validation_class: Some("UTF8Type".into()),
                comparator_type: Some("CompositeType(UTF8Type,Int32Type)".into()),
                default_validation_class: Some("BytesType".into()),
                column_metadata: vec![ColumnDefinition {
                    name: b"age".to_vec(),
                    validation_class: "Int32Type".into(),
                }],
            }],
        })
    }

    #[test]
    fn table_lookup() {
        let ks = keyspace();
        assert_eq!(ks.name(), "metrics");
        assert_eq!(ks.table("users").unwrap().name, "users");
        assert!(matches!(ks.table("nope"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn table_schema() {
        let table = keyspace().table("users").unwrap().clone();
        let schema = table.schema();

        assert_eq!(
            schema.default_name_type.as_deref(),
            Some("CompositeType(UTF8Type,Int32Type)")
        );
        assert_eq!(schema.value_types[&b"age".to_vec()], "Int32Type");
        assert!(table.column_marshaller().is_composite());
        assert_eq!(
            table.key_marshaller().serialize(&Value::from("jdoe")).unwrap(),
            b"jdoe".to_vec()
        );
    }
}
