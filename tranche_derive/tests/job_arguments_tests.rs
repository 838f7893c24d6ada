//! Tests for the JobArguments derive macro.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tranche_core::{JobArguments, JobArgumentsError};
use tranche_derive::JobArguments;

#[derive(Debug, PartialEq, JobArguments)]
struct CopyColumnArguments {
    copy_from: Vec<String>,
    copy_to: Vec<String>,
}

#[derive(Debug, PartialEq, JobArguments)]
struct WithDefaults {
    table: String,
    #[job_argument(default)]
    limit: Option<u32>,
    #[job_argument(default)]
    dry_run: bool,
}

#[derive(Debug, PartialEq, JobArguments)]
struct Pair(i64, String);

#[derive(Debug, PartialEq, JobArguments)]
struct NoArguments;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Mapping {
    from: String,
    to: String,
}

#[derive(Debug, PartialEq, JobArguments)]
struct Nested {
    mappings: Vec<Mapping>,
}

#[test]
fn fields_encode_in_declaration_order() {
    let arguments = CopyColumnArguments {
        copy_from: vec!["id".to_string()],
        copy_to: vec!["id_convert_to_bigint".to_string()],
    };
    assert_eq!(
        arguments.to_job_arguments().unwrap(),
        vec![json!(["id"]), json!(["id_convert_to_bigint"])]
    );
}

#[test]
fn fields_decode_from_positions() {
    let decoded =
        CopyColumnArguments::from_job_arguments(&[json!(["a", "b"]), json!(["c", "d"])]).unwrap();
    assert_eq!(decoded.copy_from, vec!["a", "b"]);
    assert_eq!(decoded.copy_to, vec!["c", "d"]);
}

#[test]
fn missing_required_argument_is_a_count_error() {
    let err = CopyColumnArguments::from_job_arguments(&[json!(["id"])]).unwrap_err();
    assert!(matches!(
        err,
        JobArgumentsError::Count {
            min: 2,
            max: 2,
            found: 1
        }
    ));
}

#[test]
fn extra_arguments_are_rejected() {
    let err = CopyColumnArguments::from_job_arguments(&[json!([]), json!([]), json!([])])
        .unwrap_err();
    assert!(matches!(err, JobArgumentsError::Count { found: 3, .. }));
}

#[test]
fn wrong_type_reports_its_position() {
    let err = CopyColumnArguments::from_job_arguments(&[json!(["id"]), json!(42)]).unwrap_err();
    assert!(matches!(err, JobArgumentsError::Decode { index: 1, .. }));
}

#[test]
fn trailing_defaults_may_be_omitted() {
    let decoded = WithDefaults::from_job_arguments(&[json!("users")]).unwrap();
    assert_eq!(
        decoded,
        WithDefaults {
            table: "users".to_string(),
            limit: None,
            dry_run: false,
        }
    );

    let decoded = WithDefaults::from_job_arguments(&[json!("users"), json!(10)]).unwrap();
    assert_eq!(decoded.limit, Some(10));
    assert!(!decoded.dry_run);
}

#[test]
fn defaults_are_still_encoded() {
    let arguments = WithDefaults {
        table: "users".to_string(),
        limit: Some(5),
        dry_run: true,
    };
    assert_eq!(
        arguments.to_job_arguments().unwrap(),
        vec![json!("users"), json!(5), json!(true)]
    );
}

#[test]
fn tuple_structs_are_positional() {
    let pair = Pair::from_job_arguments(&[json!(7), json!("seven")]).unwrap();
    assert_eq!(pair, Pair(7, "seven".to_string()));
    assert_eq!(pair.to_job_arguments().unwrap(), vec![json!(7), json!("seven")]);
}

#[test]
fn unit_structs_take_no_arguments() {
    assert_eq!(NoArguments::from_job_arguments(&[]).unwrap(), NoArguments);
    assert!(NoArguments.to_job_arguments().unwrap().is_empty());
    assert!(NoArguments::from_job_arguments(&[json!(1)]).is_err());
}

#[test]
fn nested_values_use_serde() {
    let decoded =
        Nested::from_job_arguments(&[json!([{ "from": "name", "to": "display_name" }])]).unwrap();
    assert_eq!(
        decoded.mappings,
        vec![Mapping {
            from: "name".to_string(),
            to: "display_name".to_string()
        }]
    );
}
