//! Property tests for instruction and changeset encoding.

use flexsync_protocol::{
    AddInteger, ArrayInsert, Changeset, ClientMessage, CreateObject, EraseObject, Instruction,
    InternString, Path, PathElement, Payload, PrimaryKey, SetInsert, Timestamp, UploadChangeset,
    UploadMessage, Update, Uuid,
};
use proptest::prelude::*;

fn path_strategy() -> impl Strategy<Value = Vec<Result<u8, u32>>> {
    prop::collection::vec(
        prop_oneof![any::<u8>().prop_map(Ok), (0u32..64).prop_map(Err)],
        0..4,
    )
}

fn primary_key_strategy() -> impl Strategy<Value = PrimaryKey> {
    prop_oneof![
        Just(PrimaryKey::Null),
        any::<i64>().prop_map(PrimaryKey::Int),
        prop::array::uniform16(any::<u8>()).prop_map(|b| PrimaryKey::Uuid(Uuid::from_bytes(b))),
    ]
}

/// A compact description of an instruction, materialized against a changeset.
#[derive(Debug, Clone)]
enum Op {
    Create(PrimaryKey),
    Erase(PrimaryKey),
    SetInt(PrimaryKey, Vec<Result<u8, u32>>, i64),
    SetString(PrimaryKey, String),
    Add(PrimaryKey, i64),
    Insert(PrimaryKey, u32, bool),
    SetAdd(PrimaryKey, i64, i32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        primary_key_strategy().prop_map(Op::Create),
        primary_key_strategy().prop_map(Op::Erase),
        (primary_key_strategy(), path_strategy(), any::<i64>())
            .prop_map(|(k, p, v)| Op::SetInt(k, p, v)),
        (primary_key_strategy(), "[a-zA-Z ]{0,16}").prop_map(|(k, s)| Op::SetString(k, s)),
        (primary_key_strategy(), any::<i64>()).prop_map(|(k, v)| Op::Add(k, v)),
        (primary_key_strategy(), 0u32..8, any::<bool>()).prop_map(|(k, i, b)| Op::Insert(k, i, b)),
        (primary_key_strategy(), any::<i64>(), 0i32..1_000_000_000)
            .prop_map(|(k, s, n)| Op::SetAdd(k, s, n)),
    ]
}

fn make_path(changeset: &mut Changeset, raw: &[Result<u8, u32>]) -> Path {
    let mut path = Path::new();
    for element in raw {
        match element {
            Ok(key) => path.push_field(changeset.intern_string(&format!("k{key}"))),
            Err(index) => path.push_index(*index),
        }
    }
    path
}

fn build(ops: &[Op]) -> Changeset {
    let mut changeset = Changeset::new();
    let table = changeset.intern_string("Item");
    let field = changeset.intern_string("value");

    for op in ops {
        let instr: Instruction = match op.clone() {
            Op::Create(object) => CreateObject { table, object }.into(),
            Op::Erase(object) => EraseObject { table, object }.into(),
            Op::SetInt(object, raw, v) => Update {
                table,
                object,
                field,
                path: make_path(&mut changeset, &raw),
                value: Payload::Int(v),
                is_default: false,
                prior_size: 0,
            }
            .into(),
            Op::SetString(object, s) => Update {
                table,
                object,
                field,
                path: Path::new(),
                value: Payload::String(changeset.add_string_range(&s)),
                is_default: true,
                prior_size: 0,
            }
            .into(),
            Op::Add(object, value) => AddInteger {
                table,
                object,
                field,
                path: Path::new(),
                value,
            }
            .into(),
            Op::Insert(object, index, b) => ArrayInsert {
                table,
                object,
                field,
                path: Path::from(vec![PathElement::Index(index)]),
                value: Payload::Bool(b),
                prior_size: index,
            }
            .into(),
            Op::SetAdd(object, seconds, nanos) => SetInsert {
                table,
                object,
                field,
                path: Path::new(),
                value: Payload::Timestamp(Timestamp::new(seconds, nanos)),
            }
            .into(),
        };
        changeset.push(instr);
    }
    changeset
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn changeset_roundtrip(ops in prop::collection::vec(op_strategy(), 0..24)) {
        let changeset = build(&ops);
        let decoded = Changeset::decode(&changeset.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded.instruction_count(), ops.len());
        prop_assert_eq!(&decoded, &changeset);
    }

    #[test]
    fn path_length_tracks_nesting(raw in path_strategy()) {
        let changeset = build(&[Op::SetInt(PrimaryKey::Int(1), raw.clone(), 0)]);
        let instr = changeset.iter().next().unwrap();
        prop_assert_eq!(instr.path_length(), 3 + raw.len());
        prop_assert_eq!(instr.as_path_instruction().unwrap().path().len(), raw.len());
    }

    #[test]
    fn upload_message_roundtrip(ops in prop::collection::vec(op_strategy(), 1..8), version in 1u64..1000) {
        let mut changeset = build(&ops);
        changeset.version = version;
        let msg = ClientMessage::Upload(UploadMessage {
            session_ident: 1,
            progress_client_version: version,
            progress_server_version: 0,
            locked_server_version: 0,
            changesets: vec![UploadChangeset {
                origin_client_version: version,
                last_integrated_server_version: 0,
                origin_timestamp: 0,
                changeset,
            }],
        });
        prop_assert_eq!(ClientMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }
}

#[test]
fn strings_survive_roundtrip() {
    let changeset = build(&[Op::SetString(PrimaryKey::Int(4), "hello world".into())]);
    let decoded = Changeset::decode(&changeset.encode().unwrap()).unwrap();
    let update = decoded.iter().next().unwrap().get_if::<Update>().unwrap();

    assert_eq!(decoded.get_string(update.table).unwrap(), "Item");
    assert_eq!(decoded.get_string(update.field).unwrap(), "value");
    match update.value {
        Payload::String(range) => assert_eq!(decoded.get_string_range(range).unwrap(), "hello world"),
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(!InternString::NPOS.is_valid());
}
