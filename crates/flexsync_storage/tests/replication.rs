//! Local writes recorded in history reproduce the same state when replayed.

use flexsync_protocol::{Changeset, CollectionType, PayloadType};
use flexsync_storage::{ColumnSpec, Database, ObjKey, Object, PathStep, Value};
use proptest::prelude::*;

fn replay(source: &Database) -> Database {
    let target = Database::open_in_memory();
    let capability = target.replication_override();
    for entry in source.uploadable_changesets(0, source.latest_version()) {
        let decoded = Changeset::decode(&entry.changeset.encode().unwrap()).unwrap();
        let mut txn = target.begin_write_without_replication(&capability).unwrap();
        txn.integrate(&decoded).unwrap();
        txn.commit().unwrap();
    }
    target
}

fn create_schema(db: &Database) {
    db.transaction(|txn| {
        txn.add_table("Owner", "_id", PayloadType::String)?;
        txn.add_embedded_table("Address")?;
        txn.add_column("Owner", "age", ColumnSpec::single(PayloadType::Int, false))?;
        txn.add_column(
            "Owner",
            "home",
            ColumnSpec::single(PayloadType::Link, true).with_link_target("Address"),
        )?;
        txn.add_column(
            "Owner",
            "addresses",
            ColumnSpec::collection(PayloadType::Link, CollectionType::List)
                .with_link_target("Address"),
        )?;
        txn.add_column("Address", "street", ColumnSpec::single(PayloadType::String, true))?;
        txn.add_column("Address", "number", ColumnSpec::single(PayloadType::Int, false))?;
        txn.add_column(
            "Owner",
            "numbers",
            ColumnSpec::collection(PayloadType::Int, CollectionType::List),
        )?;
        txn.add_column(
            "Owner",
            "labels",
            ColumnSpec::collection(PayloadType::String, CollectionType::Dictionary),
        )
    })
    .unwrap();
}

#[test]
fn embedded_objects_replicate() {
    let db = Database::open_in_memory();
    create_schema(&db);
    let key = ObjKey::from("ann");

    db.transaction(|txn| {
        txn.create_object("Owner", key.clone())?;
        let mut home = Object::new();
        home.set("street", Value::from("Main St"));
        txn.set("Owner", &key, "home", Value::Object(home))?;
        txn.list_push("Owner", &key, "addresses", Value::Object(Object::new()))?;
        txn.set_at(
            "Owner",
            &key,
            "addresses",
            &[PathStep::Index(0), PathStep::from("street")],
            "Side Rd",
        )?;
        txn.dictionary_insert("Owner", &key, "labels", "color", "red")?;
        txn.add_integer("Owner", &key, "age", 3)
    })
    .unwrap();

    let read = db.begin_read();
    let home = read.get_value("Owner", &key, "home").unwrap().as_object().unwrap();
    assert_eq!(home.get("street"), Some(&Value::from("Main St")));
    // Fields not written explicitly get the embedded table's defaults.
    assert_eq!(home.get("number"), Some(&Value::Int(0)));
    let addresses = read.get_value("Owner", &key, "addresses").unwrap().as_list().unwrap();
    assert_eq!(
        addresses[0].as_object().unwrap().get("street"),
        Some(&Value::from("Side Rd"))
    );

    let copy = replay(&db);
    assert_eq!(
        copy.begin_read().get_object("Owner", &key),
        read.get_object("Owner", &key)
    );
}

#[test]
fn set_rejects_whole_lists() {
    let db = Database::open_in_memory();
    create_schema(&db);
    let key = ObjKey::from("bob");
    let mut txn = db.begin_write();
    txn.create_object("Owner", key.clone()).unwrap();
    assert!(txn
        .set("Owner", &key, "numbers", Value::List(vec![Value::Int(1)]))
        .is_err());
}

#[derive(Debug, Clone)]
enum ListOp {
    Push(i64),
    Insert(u32, i64),
    Erase(u32),
    Move(u32, u32),
    Set(u32, i64),
    Clear,
}

fn list_op() -> impl Strategy<Value = ListOp> {
    prop_oneof![
        any::<i64>().prop_map(ListOp::Push),
        (0u32..6, any::<i64>()).prop_map(|(i, v)| ListOp::Insert(i, v)),
        (0u32..6).prop_map(ListOp::Erase),
        (0u32..6, 0u32..6).prop_map(|(a, b)| ListOp::Move(a, b)),
        (0u32..6, any::<i64>()).prop_map(|(i, v)| ListOp::Set(i, v)),
        Just(ListOp::Clear),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn list_edits_replicate(ops in prop::collection::vec(list_op(), 1..30)) {
        let db = Database::open_in_memory();
        create_schema(&db);
        let key = ObjKey::from("x");
        db.transaction(|txn| txn.create_object("Owner", key.clone())).unwrap();

        let mut model: Vec<i64> = Vec::new();
        for op in ops {
            let mut txn = db.begin_write();
            let len = model.len() as u32;
            match op {
                ListOp::Push(v) => {
                    txn.list_push("Owner", &key, "numbers", v).unwrap();
                    model.push(v);
                }
                ListOp::Insert(i, v) if i <= len => {
                    txn.list_insert("Owner", &key, "numbers", i, v).unwrap();
                    model.insert(i as usize, v);
                }
                ListOp::Erase(i) if i < len => {
                    txn.list_erase("Owner", &key, "numbers", i).unwrap();
                    model.remove(i as usize);
                }
                ListOp::Move(a, b) if a < len && b < len => {
                    txn.list_move("Owner", &key, "numbers", a, b).unwrap();
                    let v = model.remove(a as usize);
                    model.insert(b as usize, v);
                }
                ListOp::Set(i, v) if i < len => {
                    txn.set_at("Owner", &key, "numbers", &[PathStep::Index(i)], v).unwrap();
                    model[i as usize] = v;
                }
                ListOp::Clear => {
                    txn.clear("Owner", &key, "numbers").unwrap();
                    model.clear();
                }
                _ => continue,
            }
            txn.commit().unwrap();
        }

        let expected = Value::List(model.into_iter().map(Value::Int).collect());
        let read = db.begin_read();
        prop_assert_eq!(read.get_value("Owner", &key, "numbers"), Some(&expected));
        let copy = replay(&db).begin_read();
        prop_assert_eq!(copy.get_value("Owner", &key, "numbers"), Some(&expected));
    }
}
