use async_trait::async_trait;
use omnillm::omnillm::message::MessageEntry;
use omnillm::omnillm::request::{EmbeddingRequest, RequestOptions, ReturnFormat};
use omnillm::omnillm::service::{
    register_service, ChatResponse, ChunkCallback, EmbeddingResponse, Service,
};
use omnillm::omnillm::structured::FieldType;
use omnillm::{populate, AiError, ChatRequest, Role, StructSchema};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct PersonStub;

#[async_trait]
impl Service for PersonStub {
    fn name(&self) -> &str {
        "stub-person"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        // The structured-output request carries a response_format.
        assert!(request.options.return_format.is_some());
        let body = "{\"firstName\":\"Alice\",\"lastName\":\"Smith\",\"age\":32}";
        Ok(ChatResponse {
            raw: json!({"choices": [{"message": {"role": "assistant", "content": body}}]}),
            provider: "stub-person".into(),
            model: None,
            messages: vec![MessageEntry::new(Role::Assistant, body)],
            usage: None,
        })
    }

    async fn invoke_stream(
        &self,
        _request: &ChatRequest,
        _on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        Ok(())
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        Err(AiError::Unsupported {
            provider: "stub-person".into(),
            operation: "embed".into(),
        })
    }
}

fn person_schema() -> StructSchema {
    StructSchema::new("Person")
        .field("firstName", FieldType::String)
        .field("lastName", FieldType::String)
        .field("age", FieldType::Integer)
}

#[tokio::test]
async fn structured_output_populates_a_person() {
    let _ = env_logger::builder().is_test(true).try_init();
    register_service("stub-person", Arc::new(PersonStub));
    let options = RequestOptions {
        provider: Some("stub-person".into()),
        return_format: Some(ReturnFormat::Schema(person_schema())),
        ..Default::default()
    };
    let person = omnillm::omnillm::api::chat_with(
        "Tell me about a software engineer named Alice Smith who is 32.",
        Map::new(),
        options,
        HashMap::new(),
    )
    .await
    .unwrap();

    assert_eq!(person["firstName"], json!("Alice"));
    assert_eq!(person["lastName"], json!("Smith"));
    // age arrives numeric, not as a string.
    assert_eq!(person["age"], json!(32));
}

#[test]
fn populate_round_trip_modulo_defaults() {
    let schema = person_schema().field_with_default("country", FieldType::String, json!("US"));
    let original = json!({"firstName": "Bea", "lastName": "Ngo", "age": 28});
    let populated = populate(&schema, &original).unwrap();
    for (key, value) in original.as_object().unwrap() {
        assert_eq!(&populated[key], value);
    }
    assert_eq!(populated["country"], json!("US"));
}

#[test]
fn populate_array_of_schema() {
    let schema = person_schema().array_of();
    let data = json!([
        {"firstName": "A", "lastName": "One", "age": "31"},
        {"firstName": "B", "lastName": "Two", "age": 42},
    ]);
    let populated = populate(&schema, &data).unwrap();
    assert_eq!(populated.as_array().unwrap().len(), 2);
    assert_eq!(populated[0]["age"], json!(31));
}

#[test]
fn populate_reports_schema_violations() {
    let err = populate(
        &person_schema(),
        &json!({"firstName": [], "lastName": "x", "age": 1}),
    )
    .unwrap_err();
    assert!(matches!(err, AiError::SchemaViolation(_)));

    let err = populate(&person_schema().array_of(), &json!({"not": "an array"})).unwrap_err();
    assert!(matches!(err, AiError::SchemaViolation(_)));
}

#[test]
fn template_schema_flows_through_populate() {
    let schema = StructSchema::from_template(
        "Weather",
        &json!({"city": "", "tempF": 0, "sunny": false}),
    )
    .unwrap();
    let value = populate(
        &schema,
        &json!({"City": "Lisbon", "tempf": "78", "sunny": "true"}),
    )
    .unwrap();
    assert_eq!(value, json!({"city": "Lisbon", "tempF": 78, "sunny": true}));
}

#[test]
fn xml_return_format_parses_into_value() {
    let response = ChatResponse {
        raw: Value::Null,
        provider: "x".into(),
        model: None,
        messages: vec![MessageEntry::new(
            Role::Assistant,
            "<person><name>Ada</name><age>36</age></person>",
        )],
        usage: None,
    };
    let value =
        omnillm::omnillm::service::transform_response(&response, &ReturnFormat::Xml).unwrap();
    assert_eq!(value["person"]["name"], json!("Ada"));
    assert_eq!(value["person"]["age"], json!("36"));
}
