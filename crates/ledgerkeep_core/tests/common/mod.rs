#![allow(dead_code)]

use ledgerkeep_core::{
    assign_field, open_db_in_memory, unknown_field, AuditEntry, AuditRepository, CollectionNav,
    Entity, EntityDescriptor, EntityMeta, FieldDescriptor, FieldType, FieldValue, FixedClock,
    ModelResult, OwnedEdge, OwnedMany, OwnedRef, ReferenceNav, Related, SqliteAuditRepository,
};
use rusqlite::Connection;
use std::sync::Arc;
use uuid::Uuid;

pub const T0: i64 = 1_700_000_000_000;

pub fn open() -> Connection {
    open_db_in_memory().unwrap()
}

pub fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::at(T0))
}

pub fn history(conn: &Connection, entity_type: &str, id: Uuid) -> Vec<AuditEntry> {
    SqliteAuditRepository::new(conn)
        .entity_history(entity_type, id)
        .unwrap()
}

pub fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

pub fn stored_version(conn: &Connection, id: Uuid) -> Option<i64> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT version FROM entities WHERE entity_id = ?1;",
        [id.to_string()],
        |row| row.get(0),
    )
    .optional()
    .unwrap()
}

pub fn text(value: &str) -> Option<FieldValue> {
    Some(FieldValue::Text(value.to_string()))
}

/// Display-only lookup reached through a non-owned navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub id: Uuid,
    pub name: String,
}

// TestAggregate -------------------------------------------------------------

static TEST_AGGREGATE: EntityDescriptor = EntityDescriptor {
    type_name: "TestAggregate",
    audited: true,
    fields: &[
        FieldDescriptor::audited("TestProp"),
        FieldDescriptor::audited("LookupId"),
        FieldDescriptor::exempt("InternalNote"),
    ],
    owned: &[
        OwnedEdge::reference("Child", <OwnedChild as Entity>::entity_descriptor),
        OwnedEdge::collection("Items", <CollectionMember as Entity>::entity_descriptor),
    ],
    related: &["Lookup"],
    create: blank_test_aggregate,
};

fn blank_test_aggregate() -> Box<dyn Entity> {
    Box::new(TestAggregate::default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestAggregate {
    pub meta: EntityMeta,
    pub test_prop: String,
    pub lookup_id: Option<Uuid>,
    pub internal_note: Option<String>,
    pub child: OwnedRef<OwnedChild>,
    pub items: OwnedMany<CollectionMember>,
    pub lookup: Related<Lookup>,
}

impl TestAggregate {
    /// Fresh aggregate with loaded, empty navigations.
    pub fn new(test_prop: &str) -> Self {
        Self {
            meta: EntityMeta::unassigned(),
            test_prop: test_prop.to_string(),
            lookup_id: None,
            internal_note: None,
            child: OwnedRef::empty(),
            items: OwnedMany::empty(),
            lookup: Related::none(),
        }
    }

    pub fn with_child(mut self, child: OwnedChild) -> Self {
        self.child.set(Some(child));
        self
    }

    pub fn with_item(mut self, item: CollectionMember) -> Self {
        self.items.push(item);
        self
    }

    pub fn child(&self) -> &OwnedChild {
        self.child.get().unwrap()
    }

    pub fn item(&self, test_prop: &str) -> &CollectionMember {
        self.items
            .items()
            .iter()
            .find(|item| item.test_prop == test_prop)
            .unwrap()
    }
}

impl Entity for TestAggregate {
    fn entity_descriptor() -> &'static EntityDescriptor {
        &TEST_AGGREGATE
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        &TEST_AGGREGATE
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "TestProp" => Some(self.test_prop.to_field_value()),
            "LookupId" => Some(self.lookup_id.to_field_value()),
            "InternalNote" => Some(self.internal_note.to_field_value()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()> {
        let entity_type = TEST_AGGREGATE.type_name;
        match name {
            "TestProp" => assign_field(&mut self.test_prop, value, entity_type, name),
            "LookupId" => assign_field(&mut self.lookup_id, value, entity_type, name),
            "InternalNote" => assign_field(&mut self.internal_note, value, entity_type, name),
            _ => Err(unknown_field(entity_type, name)),
        }
    }

    fn reference(&self, name: &str) -> Option<&dyn ReferenceNav> {
        match name {
            "Child" => Some(&self.child),
            _ => None,
        }
    }

    fn reference_mut(&mut self, name: &str) -> Option<&mut dyn ReferenceNav> {
        match name {
            "Child" => Some(&mut self.child),
            _ => None,
        }
    }

    fn collection(&self, name: &str) -> Option<&dyn CollectionNav> {
        match name {
            "Items" => Some(&self.items),
            _ => None,
        }
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionNav> {
        match name {
            "Items" => Some(&mut self.items),
            _ => None,
        }
    }

    fn clear_related(&mut self) {
        self.lookup.clear();
    }
}

// OwnedChild ----------------------------------------------------------------

static OWNED_CHILD: EntityDescriptor = EntityDescriptor {
    type_name: "OwnedChild",
    audited: true,
    fields: &[FieldDescriptor::audited("OwnedTestProp")],
    owned: &[],
    related: &[],
    create: blank_owned_child,
};

fn blank_owned_child() -> Box<dyn Entity> {
    Box::new(OwnedChild::default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnedChild {
    pub meta: EntityMeta,
    pub owned_test_prop: String,
}

impl OwnedChild {
    pub fn new(owned_test_prop: &str) -> Self {
        Self {
            meta: EntityMeta::unassigned(),
            owned_test_prop: owned_test_prop.to_string(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.meta.id = id;
        self
    }
}

impl Entity for OwnedChild {
    fn entity_descriptor() -> &'static EntityDescriptor {
        &OWNED_CHILD
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        &OWNED_CHILD
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "OwnedTestProp" => Some(self.owned_test_prop.to_field_value()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()> {
        match name {
            "OwnedTestProp" => {
                assign_field(&mut self.owned_test_prop, value, OWNED_CHILD.type_name, name)
            }
            _ => Err(unknown_field(OWNED_CHILD.type_name, name)),
        }
    }
}

// CollectionMember ----------------------------------------------------------

static COLLECTION_MEMBER: EntityDescriptor = EntityDescriptor {
    type_name: "CollectionMember",
    audited: true,
    fields: &[FieldDescriptor::audited("TestProp")],
    owned: &[OwnedEdge::collection(
        "Notes",
        <MemberNote as Entity>::entity_descriptor,
    )],
    related: &[],
    create: blank_collection_member,
};

fn blank_collection_member() -> Box<dyn Entity> {
    Box::new(CollectionMember::default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionMember {
    pub meta: EntityMeta,
    pub test_prop: String,
    pub notes: OwnedMany<MemberNote>,
}

impl CollectionMember {
    pub fn new(test_prop: &str) -> Self {
        Self {
            meta: EntityMeta::unassigned(),
            test_prop: test_prop.to_string(),
            notes: OwnedMany::empty(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.meta.id = id;
        self
    }

    pub fn with_note(mut self, note: MemberNote) -> Self {
        self.notes.push(note);
        self
    }
}

impl Entity for CollectionMember {
    fn entity_descriptor() -> &'static EntityDescriptor {
        &COLLECTION_MEMBER
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        &COLLECTION_MEMBER
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "TestProp" => Some(self.test_prop.to_field_value()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()> {
        match name {
            "TestProp" => {
                assign_field(&mut self.test_prop, value, COLLECTION_MEMBER.type_name, name)
            }
            _ => Err(unknown_field(COLLECTION_MEMBER.type_name, name)),
        }
    }

    fn collection(&self, name: &str) -> Option<&dyn CollectionNav> {
        match name {
            "Notes" => Some(&self.notes),
            _ => None,
        }
    }

    fn collection_mut(&mut self, name: &str) -> Option<&mut dyn CollectionNav> {
        match name {
            "Notes" => Some(&mut self.notes),
            _ => None,
        }
    }
}

// MemberNote ----------------------------------------------------------------

static MEMBER_NOTE: EntityDescriptor = EntityDescriptor {
    type_name: "MemberNote",
    audited: true,
    fields: &[FieldDescriptor::audited("Body")],
    owned: &[],
    related: &[],
    create: blank_member_note,
};

fn blank_member_note() -> Box<dyn Entity> {
    Box::new(MemberNote::default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberNote {
    pub meta: EntityMeta,
    pub body: String,
}

impl MemberNote {
    pub fn new(body: &str) -> Self {
        Self {
            meta: EntityMeta::unassigned(),
            body: body.to_string(),
        }
    }
}

impl Entity for MemberNote {
    fn entity_descriptor() -> &'static EntityDescriptor {
        &MEMBER_NOTE
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        &MEMBER_NOTE
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "Body" => Some(self.body.to_field_value()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()> {
        match name {
            "Body" => assign_field(&mut self.body, value, MEMBER_NOTE.type_name, name),
            _ => Err(unknown_field(MEMBER_NOTE.type_name, name)),
        }
    }
}

// CacheEntry: audit-exempt type ---------------------------------------------

static CACHE_ENTRY: EntityDescriptor = EntityDescriptor {
    type_name: "CacheEntry",
    audited: false,
    fields: &[FieldDescriptor::audited("Payload")],
    owned: &[],
    related: &[],
    create: blank_cache_entry,
};

fn blank_cache_entry() -> Box<dyn Entity> {
    Box::new(CacheEntry::default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    pub meta: EntityMeta,
    pub payload: String,
}

impl CacheEntry {
    pub fn new(payload: &str) -> Self {
        Self {
            meta: EntityMeta::unassigned(),
            payload: payload.to_string(),
        }
    }
}

impl Entity for CacheEntry {
    fn entity_descriptor() -> &'static EntityDescriptor {
        &CACHE_ENTRY
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        &CACHE_ENTRY
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "Payload" => Some(self.payload.to_field_value()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()> {
        match name {
            "Payload" => assign_field(&mut self.payload, value, CACHE_ENTRY.type_name, name),
            _ => Err(unknown_field(CACHE_ENTRY.type_name, name)),
        }
    }
}

// Node: owns its own type, used for key cycles --------------------------------

static NODE: EntityDescriptor = EntityDescriptor {
    type_name: "Node",
    audited: true,
    fields: &[FieldDescriptor::audited("Label")],
    owned: &[OwnedEdge::reference("Next", <Node as Entity>::entity_descriptor)],
    related: &[],
    create: blank_node,
};

fn blank_node() -> Box<dyn Entity> {
    Box::new(Node::default())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub meta: EntityMeta,
    pub label: String,
    pub next: OwnedRef<Node>,
}

impl Node {
    pub fn new(id: Uuid, label: &str) -> Self {
        Self {
            meta: EntityMeta {
                id,
                version: 1,
                is_soft_deleted: false,
            },
            label: label.to_string(),
            next: OwnedRef::empty(),
        }
    }

    pub fn then(mut self, next: Node) -> Self {
        self.next.set(Some(next));
        self
    }
}

impl Entity for Node {
    fn entity_descriptor() -> &'static EntityDescriptor {
        &NODE
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        &NODE
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "Label" => Some(self.label.to_field_value()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: FieldValue) -> ModelResult<()> {
        match name {
            "Label" => assign_field(&mut self.label, value, NODE.type_name, name),
            _ => Err(unknown_field(NODE.type_name, name)),
        }
    }

    fn reference(&self, name: &str) -> Option<&dyn ReferenceNav> {
        match name {
            "Next" => Some(&self.next),
            _ => None,
        }
    }

    fn reference_mut(&mut self, name: &str) -> Option<&mut dyn ReferenceNav> {
        match name {
            "Next" => Some(&mut self.next),
            _ => None,
        }
    }
}
