//! Applying instructions to a snapshot.
//!
//! This is the single mutation path of the database: local writes are first
//! expressed as instructions and then applied here, exactly like changesets
//! downloaded from the server.

use crate::error::{StorageError, StorageResult};
use crate::object::{ColumnSpec, Link, ObjKey, Object, Table, TableKind, Value};
use crate::snapshot::Snapshot;
use flexsync_protocol::{
    AddColumn, AddInteger, AddTable, ArrayErase, ArrayInsert, ArrayMove, Changeset, Clear,
    CreateObject, EraseColumn, EraseObject, EraseTable, Instruction, PathElement,
    PathInstruction, Payload, PrimaryKey, SetErase, SetInsert, TableType, Update,
};
use std::collections::BTreeMap;

/// Applies every instruction of a changeset, in order.
pub(crate) fn apply_changeset(snapshot: &mut Snapshot, changeset: &Changeset) -> StorageResult<()> {
    for instr in changeset.iter() {
        apply_instruction(snapshot, changeset, instr)?;
    }
    Ok(())
}

/// Applies one instruction. Strings are resolved against `changeset`.
pub(crate) fn apply_instruction(
    snapshot: &mut Snapshot,
    changeset: &Changeset,
    instr: &Instruction,
) -> StorageResult<()> {
    match instr {
        Instruction::AddTable(i) => add_table(snapshot, changeset, i),
        Instruction::EraseTable(i) => erase_table(snapshot, changeset, i),
        Instruction::AddColumn(i) => add_column(snapshot, changeset, i),
        Instruction::EraseColumn(i) => erase_column(snapshot, changeset, i),
        Instruction::CreateObject(i) => create_object(snapshot, changeset, i),
        Instruction::EraseObject(i) => erase_object(snapshot, changeset, i),
        Instruction::Update(i) => update(snapshot, changeset, i),
        Instruction::AddInteger(i) => add_integer(snapshot, changeset, i),
        Instruction::ArrayInsert(i) => array_insert(snapshot, changeset, i),
        Instruction::ArrayMove(i) => array_move(snapshot, changeset, i),
        Instruction::ArrayErase(i) => array_erase(snapshot, changeset, i),
        Instruction::Clear(i) => clear(snapshot, changeset, i),
        Instruction::SetInsert(i) => set_insert(snapshot, changeset, i),
        Instruction::SetErase(i) => set_erase(snapshot, changeset, i),
    }
}

/// Converts an instruction primary key to an owned key.
pub(crate) fn object_key(changeset: &Changeset, pk: &PrimaryKey) -> StorageResult<ObjKey> {
    Ok(match pk {
        PrimaryKey::Null => ObjKey::Null,
        PrimaryKey::Int(v) => ObjKey::Int(*v),
        PrimaryKey::GlobalKey(k) => ObjKey::GlobalKey(*k),
        PrimaryKey::String(s) => ObjKey::String(changeset.get_string(*s)?.to_string()),
        PrimaryKey::ObjectId(oid) => ObjKey::ObjectId(*oid),
        PrimaryKey::Uuid(u) => ObjKey::Uuid(*u),
    })
}

fn payload_value(
    changeset: &Changeset,
    payload: &Payload,
    template: Option<Object>,
) -> StorageResult<Value> {
    Ok(match *payload {
        Payload::Null => Value::Null,
        Payload::Int(v) => Value::Int(v),
        Payload::Bool(v) => Value::Bool(v),
        Payload::String(range) => Value::String(changeset.get_string_range(range)?.to_string()),
        Payload::Binary(range) => Value::Binary(changeset.get_binary_range(range)?.to_vec()),
        Payload::Timestamp(t) => Value::Timestamp(t),
        Payload::Float(v) => Value::Float(v),
        Payload::Double(v) => Value::Double(v),
        Payload::Decimal(d) => Value::Decimal(d),
        Payload::ObjectId(oid) => Value::ObjectId(oid),
        Payload::Uuid(u) => Value::Uuid(u),
        Payload::Link(link) => Value::Link(Link {
            table: changeset.get_string(link.target_table)?.to_string(),
            key: object_key(changeset, &link.target)?,
        }),
        Payload::ObjectValue => Value::Object(template.unwrap_or_default()),
        Payload::Dictionary => Value::Dictionary(BTreeMap::new()),
        Payload::GlobalKey(_) | Payload::Erased => {
            return Err(StorageError::invalid_value(format!(
                "{:?} payload cannot be stored",
                payload.payload_type()
            )))
        }
    })
}

fn add_table(snapshot: &mut Snapshot, changeset: &Changeset, i: &AddTable) -> StorageResult<()> {
    let name = changeset.get_string(i.table)?;
    let kind = match i.table_type {
        TableType::TopLevel(spec) => TableKind::TopLevel {
            pk_field: changeset.get_string(spec.field)?.to_string(),
            pk_type: spec.pk_type,
            nullable: spec.nullable,
        },
        TableType::Embedded => TableKind::Embedded,
    };
    match snapshot.table(name) {
        Some(existing) if *existing.kind() == kind => Ok(()),
        Some(_) => Err(StorageError::TableMismatch(name.to_string())),
        None => {
            snapshot.insert_table(Table::new(name, kind, i.is_asymmetric));
            Ok(())
        }
    }
}

fn erase_table(snapshot: &mut Snapshot, changeset: &Changeset, i: &EraseTable) -> StorageResult<()> {
    let name = changeset.get_string(i.table)?;
    snapshot
        .remove_table(name)
        .map(|_| ())
        .ok_or_else(|| StorageError::NoSuchTable(name.to_string()))
}

fn add_column(snapshot: &mut Snapshot, changeset: &Changeset, i: &AddColumn) -> StorageResult<()> {
    let table_name = changeset.get_string(i.table)?;
    let field = changeset.get_string(i.field)?;
    let spec = ColumnSpec {
        value_type: i.value_type,
        nullable: i.nullable,
        collection_type: i.collection_type,
        key_type: i.key_type,
        link_target: if i.link_target_table.is_valid() {
            Some(changeset.get_string(i.link_target_table)?.to_string())
        } else {
            None
        },
    };
    let table = snapshot.table_mut(table_name)?;
    match table.column(field) {
        Some(existing) if *existing == spec => Ok(()),
        Some(_) => Err(StorageError::ColumnMismatch {
            table: table_name.to_string(),
            column: field.to_string(),
        }),
        None => {
            table.add_column(field, spec);
            Ok(())
        }
    }
}

fn erase_column(
    snapshot: &mut Snapshot,
    changeset: &Changeset,
    i: &EraseColumn,
) -> StorageResult<()> {
    let table_name = changeset.get_string(i.table)?;
    let field = changeset.get_string(i.field)?;
    if snapshot.table_mut(table_name)?.erase_column(field) {
        Ok(())
    } else {
        Err(StorageError::no_such_column(table_name, field))
    }
}

fn create_object(
    snapshot: &mut Snapshot,
    changeset: &Changeset,
    i: &CreateObject,
) -> StorageResult<()> {
    let table_name = changeset.get_string(i.table)?;
    let key = object_key(changeset, &i.object)?;
    let table = snapshot.table_mut(table_name)?;
    if *table.kind() == TableKind::Embedded {
        return Err(StorageError::invalid_value(format!(
            "objects of embedded table '{table_name}' are created in place"
        )));
    }
    if table.get(&key).is_none() {
        let obj = table.new_object(&key);
        table.insert_object(key, obj);
    }
    Ok(())
}

fn erase_object(
    snapshot: &mut Snapshot,
    changeset: &Changeset,
    i: &EraseObject,
) -> StorageResult<()> {
    let table_name = changeset.get_string(i.table)?;
    let key = object_key(changeset, &i.object)?;
    snapshot.table_mut(table_name)?.remove(&key);
    Ok(())
}

/// Default field values for an embedded object created directly in `field`.
fn embedded_template(
    snapshot: &Snapshot,
    changeset: &Changeset,
    instr: &dyn PathInstruction,
) -> StorageResult<Option<Object>> {
    if instr.path().len() > 1 {
        return Ok(None);
    }
    let table = changeset.get_string(instr.table())?;
    let field = changeset.get_string(instr.field())?;
    let target = snapshot
        .table(table)
        .and_then(|t| t.column(field))
        .and_then(|spec| spec.link_target.as_deref())
        .and_then(|name| snapshot.table(name));
    Ok(match target {
        Some(t) if *t.kind() == TableKind::Embedded => Some(t.new_object(&ObjKey::Null)),
        _ => None,
    })
}

fn field_value<'a>(
    snapshot: &'a mut Snapshot,
    changeset: &Changeset,
    instr: &dyn PathInstruction,
) -> StorageResult<&'a mut Value> {
    let table = changeset.get_string(instr.table())?;
    let field = changeset.get_string(instr.field())?;
    let key = object_key(changeset, instr.object())?;
    snapshot
        .object_mut(table, &key)?
        .get_mut(field)
        .ok_or_else(|| StorageError::no_such_column(table, field))
}

fn descend<'a>(
    mut value: &'a mut Value,
    changeset: &Changeset,
    path: &[PathElement],
) -> StorageResult<&'a mut Value> {
    for element in path {
        value = match (value, element) {
            (Value::List(items), PathElement::Index(index)) => {
                let size = items.len();
                items
                    .get_mut(*index as usize)
                    .ok_or(StorageError::IndexOutOfBounds { index: *index, size })?
            }
            (Value::Dictionary(entries), PathElement::Field(key)) => {
                let key = changeset.get_string(*key)?;
                entries
                    .get_mut(key)
                    .ok_or_else(|| StorageError::invalid_path(format!("no entry '{key}'")))?
            }
            (Value::Object(obj), PathElement::Field(field)) => {
                let field = changeset.get_string(*field)?;
                obj.get_mut(field)
                    .ok_or_else(|| StorageError::invalid_path(format!("no field '{field}'")))?
            }
            (other, element) => {
                return Err(StorageError::invalid_path(format!(
                    "cannot address {} with {element:?}",
                    other.type_name()
                )))
            }
        };
    }
    Ok(value)
}

fn target<'a>(
    snapshot: &'a mut Snapshot,
    changeset: &Changeset,
    instr: &dyn PathInstruction,
) -> StorageResult<&'a mut Value> {
    let root = field_value(snapshot, changeset, instr)?;
    descend(root, changeset, instr.path().as_slice())
}

/// Resolves the list addressed by all but the last path element, plus that
/// element as an index.
fn list_and_index<'a>(
    snapshot: &'a mut Snapshot,
    changeset: &Changeset,
    instr: &dyn PathInstruction,
) -> StorageResult<(&'a mut Vec<Value>, u32)> {
    let (last, parent) = instr
        .path()
        .as_slice()
        .split_last()
        .ok_or_else(|| StorageError::invalid_path("list operation without an index"))?;
    let index = last
        .as_index()
        .ok_or_else(|| StorageError::invalid_path("list operation must end in an index"))?;
    let root = field_value(snapshot, changeset, instr)?;
    match descend(root, changeset, parent)? {
        Value::List(items) => Ok((items, index)),
        other => Err(StorageError::invalid_path(format!(
            "expected a list, found {}",
            other.type_name()
        ))),
    }
}

fn update(snapshot: &mut Snapshot, changeset: &Changeset, i: &Update) -> StorageResult<()> {
    let template = match i.value {
        Payload::ObjectValue => embedded_template(snapshot, changeset, i)?,
        _ => None,
    };
    let root = field_value(snapshot, changeset, i)?;
    let Some((last, parent)) = i.path.as_slice().split_last() else {
        *root = payload_value(changeset, &i.value, template)?;
        return Ok(());
    };
    match (descend(root, changeset, parent)?, last) {
        (Value::List(items), PathElement::Index(index)) => {
            let size = items.len();
            let slot = items
                .get_mut(*index as usize)
                .ok_or(StorageError::IndexOutOfBounds { index: *index, size })?;
            *slot = payload_value(changeset, &i.value, template)?;
        }
        (Value::Dictionary(entries), PathElement::Field(key)) => {
            let key = changeset.get_string(*key)?;
            if i.value == Payload::Erased {
                entries.remove(key);
            } else {
                entries.insert(key.to_string(), payload_value(changeset, &i.value, template)?);
            }
        }
        (Value::Object(obj), PathElement::Field(field)) => {
            let field = changeset.get_string(*field)?;
            obj.set(field, payload_value(changeset, &i.value, template)?);
        }
        (other, element) => {
            return Err(StorageError::invalid_path(format!(
                "cannot update {} at {element:?}",
                other.type_name()
            )))
        }
    }
    Ok(())
}

fn add_integer(snapshot: &mut Snapshot, changeset: &Changeset, i: &AddInteger) -> StorageResult<()> {
    match target(snapshot, changeset, i)? {
        Value::Int(v) => *v = v.wrapping_add(i.value),
        Value::Null => {}
        other => {
            return Err(StorageError::invalid_value(format!(
                "cannot add to {}",
                other.type_name()
            )))
        }
    }
    Ok(())
}

fn array_insert(
    snapshot: &mut Snapshot,
    changeset: &Changeset,
    i: &ArrayInsert,
) -> StorageResult<()> {
    let template = match i.value {
        Payload::ObjectValue => embedded_template(snapshot, changeset, i)?,
        _ => None,
    };
    let value = payload_value(changeset, &i.value, template)?;
    let (items, index) = list_and_index(snapshot, changeset, i)?;
    if index as usize > items.len() {
        return Err(StorageError::IndexOutOfBounds {
            index,
            size: items.len(),
        });
    }
    items.insert(index as usize, value);
    Ok(())
}

fn array_move(snapshot: &mut Snapshot, changeset: &Changeset, i: &ArrayMove) -> StorageResult<()> {
    let (items, from) = list_and_index(snapshot, changeset, i)?;
    let size = items.len();
    for index in [from, i.ndx_2] {
        if index as usize >= size {
            return Err(StorageError::IndexOutOfBounds { index, size });
        }
    }
    let value = items.remove(from as usize);
    items.insert(i.ndx_2 as usize, value);
    Ok(())
}

fn array_erase(snapshot: &mut Snapshot, changeset: &Changeset, i: &ArrayErase) -> StorageResult<()> {
    let (items, index) = list_and_index(snapshot, changeset, i)?;
    if index as usize >= items.len() {
        return Err(StorageError::IndexOutOfBounds {
            index,
            size: items.len(),
        });
    }
    items.remove(index as usize);
    Ok(())
}

fn clear(snapshot: &mut Snapshot, changeset: &Changeset, i: &Clear) -> StorageResult<()> {
    match target(snapshot, changeset, i)? {
        Value::List(items) | Value::Set(items) => items.clear(),
        Value::Dictionary(entries) => entries.clear(),
        other => {
            return Err(StorageError::invalid_value(format!(
                "cannot clear {}",
                other.type_name()
            )))
        }
    }
    Ok(())
}

fn set_items<'a>(
    snapshot: &'a mut Snapshot,
    changeset: &Changeset,
    instr: &dyn PathInstruction,
) -> StorageResult<&'a mut Vec<Value>> {
    match target(snapshot, changeset, instr)? {
        Value::Set(items) => Ok(items),
        other => Err(StorageError::invalid_value(format!(
            "expected a set, found {}",
            other.type_name()
        ))),
    }
}

fn set_insert(snapshot: &mut Snapshot, changeset: &Changeset, i: &SetInsert) -> StorageResult<()> {
    let value = payload_value(changeset, &i.value, None)?;
    let items = set_items(snapshot, changeset, i)?;
    if !items.contains(&value) {
        items.push(value);
    }
    Ok(())
}

fn set_erase(snapshot: &mut Snapshot, changeset: &Changeset, i: &SetErase) -> StorageResult<()> {
    let value = payload_value(changeset, &i.value, None)?;
    let items = set_items(snapshot, changeset, i)?;
    if let Some(pos) = items.iter().position(|v| *v == value) {
        items.remove(pos);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexsync_protocol::{CollectionType, InternString, Path, PayloadType, PrimaryKeySpec};

    fn person_schema(changeset: &mut Changeset) -> InternString {
        let table = changeset.intern_string("Person");
        let pk = changeset.intern_string("_id");
        changeset.push(AddTable {
            table,
            table_type: TableType::TopLevel(PrimaryKeySpec {
                field: pk,
                pk_type: PayloadType::Int,
                nullable: false,
            }),
            is_asymmetric: false,
        });
        for (name, collection_type) in [
            ("age", CollectionType::Single),
            ("tags", CollectionType::List),
            ("scores", CollectionType::Dictionary),
            ("friends", CollectionType::Set),
        ] {
            let field = changeset.intern_string(name);
            changeset.push(AddColumn {
                table,
                field,
                value_type: PayloadType::Int,
                nullable: false,
                collection_type,
                key_type: if collection_type == CollectionType::Dictionary {
                    PayloadType::String
                } else {
                    PayloadType::Null
                },
                link_target_table: InternString::NPOS,
            });
        }
        changeset.push(CreateObject {
            table,
            object: PrimaryKey::Int(1),
        });
        table
    }

    fn apply_all(changeset: &Changeset) -> StorageResult<Snapshot> {
        let mut snapshot = Snapshot::default();
        apply_changeset(&mut snapshot, changeset)?;
        Ok(snapshot)
    }

    #[test]
    fn schema_and_objects() {
        let mut changeset = Changeset::new();
        let table = person_schema(&mut changeset);
        // Creating an existing object is a no-op.
        changeset.push(CreateObject {
            table,
            object: PrimaryKey::Int(1),
        });

        let snapshot = apply_all(&changeset).unwrap();
        let key = ObjKey::Int(1);
        assert_eq!(snapshot.object_count("Person"), 1);
        assert_eq!(snapshot.get_value("Person", &key, "_id"), Some(&Value::Int(1)));
        assert_eq!(snapshot.get_value("Person", &key, "age"), Some(&Value::Int(0)));
        assert_eq!(
            snapshot.get_value("Person", &key, "tags"),
            Some(&Value::List(Vec::new()))
        );
    }

    #[test]
    fn list_operations() {
        let mut changeset = Changeset::new();
        let table = person_schema(&mut changeset);
        let field = changeset.intern_string("tags");
        for (index, value) in [(0, 10), (1, 20), (0, 5)] {
            changeset.push(ArrayInsert {
                table,
                object: PrimaryKey::Int(1),
                field,
                path: Path::from(vec![PathElement::Index(index)]),
                value: Payload::Int(value),
                prior_size: 0,
            });
        }
        changeset.push(ArrayMove {
            table,
            object: PrimaryKey::Int(1),
            field,
            path: Path::from(vec![PathElement::Index(0)]),
            ndx_2: 2,
            prior_size: 3,
        });
        changeset.push(ArrayErase {
            table,
            object: PrimaryKey::Int(1),
            field,
            path: Path::from(vec![PathElement::Index(0)]),
            prior_size: 3,
        });
        changeset.push(Update {
            table,
            object: PrimaryKey::Int(1),
            field,
            path: Path::from(vec![PathElement::Index(1)]),
            value: Payload::Int(99),
            is_default: false,
            prior_size: 2,
        });

        let snapshot = apply_all(&changeset).unwrap();
        assert_eq!(
            snapshot.get_value("Person", &ObjKey::Int(1), "tags"),
            Some(&Value::List(vec![Value::Int(20), Value::Int(99)]))
        );
    }

    #[test]
    fn insert_past_end_is_rejected() {
        let mut changeset = Changeset::new();
        let table = person_schema(&mut changeset);
        let field = changeset.intern_string("tags");
        changeset.push(ArrayInsert {
            table,
            object: PrimaryKey::Int(1),
            field,
            path: Path::from(vec![PathElement::Index(3)]),
            value: Payload::Int(1),
            prior_size: 0,
        });
        assert!(matches!(
            apply_all(&changeset),
            Err(StorageError::IndexOutOfBounds { index: 3, size: 0 })
        ));
    }

    #[test]
    fn dictionary_set_and_counter() {
        let mut changeset = Changeset::new();
        let table = person_schema(&mut changeset);
        let scores = changeset.intern_string("scores");
        let math = changeset.intern_string("math");
        let art = changeset.intern_string("art");
        let friends = changeset.intern_string("friends");
        let age = changeset.intern_string("age");
        let object = PrimaryKey::Int(1);

        for (key, value) in [(math, Payload::Int(90)), (art, Payload::Int(70)), (art, Payload::Erased)] {
            changeset.push(Update {
                table,
                object,
                field: scores,
                path: Path::from(vec![PathElement::Field(key)]),
                value,
                is_default: false,
                prior_size: 0,
            });
        }
        for value in [3, 4, 3] {
            changeset.push(SetInsert {
                table,
                object,
                field: friends,
                path: Path::new(),
                value: Payload::Int(value),
            });
        }
        changeset.push(SetErase {
            table,
            object,
            field: friends,
            path: Path::new(),
            value: Payload::Int(3),
        });
        changeset.push(AddInteger {
            table,
            object,
            field: age,
            path: Path::new(),
            value: 5,
        });

        let snapshot = apply_all(&changeset).unwrap();
        let key = ObjKey::Int(1);
        let scores = snapshot.get_value("Person", &key, "scores").unwrap();
        assert_eq!(scores.as_dictionary().unwrap().len(), 1);
        assert_eq!(scores.as_dictionary().unwrap()["math"], Value::Int(90));
        assert_eq!(
            snapshot.get_value("Person", &key, "friends"),
            Some(&Value::Set(vec![Value::Int(4)]))
        );
        assert_eq!(snapshot.get_value("Person", &key, "age"), Some(&Value::Int(5)));
    }

    #[test]
    fn clear_and_erase() {
        let mut changeset = Changeset::new();
        let table = person_schema(&mut changeset);
        let tags = changeset.intern_string("tags");
        changeset.push(ArrayInsert {
            table,
            object: PrimaryKey::Int(1),
            field: tags,
            path: Path::from(vec![PathElement::Index(0)]),
            value: Payload::Int(1),
            prior_size: 0,
        });
        changeset.push(Clear {
            table,
            object: PrimaryKey::Int(1),
            field: tags,
            path: Path::new(),
            collection_type: CollectionType::List,
        });
        let mut snapshot = apply_all(&changeset).unwrap();
        assert_eq!(
            snapshot.get_value("Person", &ObjKey::Int(1), "tags"),
            Some(&Value::List(Vec::new()))
        );

        let mut erase = Changeset::new();
        let table = erase.intern_string("Person");
        erase.push(EraseObject {
            table,
            object: PrimaryKey::Int(1),
        });
        erase.push(EraseTable { table });
        apply_changeset(&mut snapshot, &erase).unwrap();
        assert!(!snapshot.has_table("Person"));
    }

    #[test]
    fn mismatched_table_is_rejected() {
        let mut changeset = Changeset::new();
        let table = person_schema(&mut changeset);
        changeset.push(AddTable {
            table,
            table_type: TableType::Embedded,
            is_asymmetric: false,
        });
        assert!(matches!(
            apply_all(&changeset),
            Err(StorageError::TableMismatch(name)) if name == "Person"
        ));
    }
}
