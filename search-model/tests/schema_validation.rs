use search_model::{Document, Field, Schema, SearchError};

fn catalog() -> Schema {
    Schema::builder()
        .field("id", Field::identifier().stored())
        .field("title", Field::long_text().stored().sortable())
        .field("price", Field::numeric().stored())
        .build()
        .expect("valid schema")
}

#[test]
fn missing_identifier_is_a_schema_violation() {
    let schema = catalog();
    let doc = Document::new().with("title", "Banana").with("price", 3);
    let err = schema.validate(&doc).expect_err("identifier required");
    assert!(matches!(err, SearchError::SchemaViolation(_)), "{err}");
}

#[test]
fn unknown_field_is_a_schema_violation() {
    let schema = catalog();
    let doc = Document::new().with("id", "1").with("colour", "red");
    let err = schema.validate(&doc).expect_err("unknown field");
    match err {
        SearchError::SchemaViolation(msg) => assert!(msg.contains("colour"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn numeric_text_must_parse() {
    let schema = catalog();
    assert!(schema.validate(&Document::new().with("id", "1").with("price", "12")).is_ok());
    assert!(schema.validate(&Document::new().with("id", "1").with("price", "twelve")).is_err());
}

#[test]
fn schema_without_identifier_accepts_any_known_fields() {
    let schema = Schema::builder().field("body", Field::long_text()).build().unwrap();
    assert_eq!(schema.identifier_field(), None);
    assert!(schema.validate(&Document::new().with("body", "hello")).is_ok());
}

#[test]
fn field_order_is_declaration_order() {
    assert_eq!(catalog().field_names(), vec!["id", "title", "price"]);
}
