//! Parameter schemas and their JSON-schema rendering.

use serde::{Deserialize, Serialize};
use serde_json::{Map, json};

/// JSON-schema primitive types supported in tool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Integer => "integer",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Array => "array",
            PropertyType::Object => "object",
        }
    }
}

/// One tool parameter.  `items` describes array elements, `properties`
/// nested object members; both recurse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSchema {
    pub name: String,
    pub property_type: PropertyType,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParamSchema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<ParamSchema>,
}

impl ParamSchema {
    pub fn new(name: impl Into<String>, ty: PropertyType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            property_type: ty,
            description: description.into(),
            required: false,
            enum_values: Vec::new(),
            items: None,
            properties: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, PropertyType::String, description)
    }

    pub fn integer(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Integer, description)
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Boolean, description)
    }

    pub fn array(
        name: impl Into<String>,
        description: impl Into<String>,
        items: ParamSchema,
    ) -> Self {
        let mut schema = Self::new(name, PropertyType::Array, description);
        schema.items = Some(Box::new(items));
        schema
    }

    pub fn object(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: Vec<ParamSchema>,
    ) -> Self {
        let mut schema = Self::new(name, PropertyType::Object, description);
        schema.properties = properties;
        schema
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }
}

/// Renders a parameter list as a JSON-schema object node
/// (`{type:"object", properties, required}`).
pub fn params_to_json_schema(params: &[ParamSchema]) -> serde_json::Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for p in params {
        properties.insert(p.name.clone(), property_to_json(p));
        if p.required {
            required.push(json!(p.name));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn property_to_json(p: &ParamSchema) -> serde_json::Value {
    let mut node = Map::new();
    node.insert("type".to_string(), json!(p.property_type.as_str()));
    if !p.description.is_empty() {
        node.insert("description".to_string(), json!(p.description));
    }
    if !p.enum_values.is_empty() {
        node.insert("enum".to_string(), json!(p.enum_values));
    }
    if let Some(items) = &p.items {
        node.insert("items".to_string(), property_to_json(items));
    }
    if p.property_type == PropertyType::Object && !p.properties.is_empty() {
        let nested = params_to_json_schema(&p.properties);
        node.insert("properties".to_string(), nested["properties"].clone());
        node.insert("required".to_string(), nested["required"].clone());
    }
    serde_json::Value::Object(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_schema() {
        let params = vec![
            ParamSchema::string("query", "Search query").required(),
            ParamSchema::integer("count", "Result count"),
        ];
        let schema = params_to_json_schema(&params);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["properties"]["count"]["type"], "integer");
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[test]
    fn enum_values_render_as_array() {
        let params = vec![
            ParamSchema::string("unit", "Temperature unit").with_enum(["celsius", "fahrenheit"]),
        ];
        let schema = params_to_json_schema(&params);
        assert_eq!(
            schema["properties"]["unit"]["enum"],
            json!(["celsius", "fahrenheit"])
        );
    }

    #[test]
    fn nested_object_and_array_recurse() {
        let params = vec![ParamSchema::object(
            "filter",
            "Search filter",
            vec![
                ParamSchema::string("field", "Field name").required(),
                ParamSchema::array(
                    "values",
                    "Allowed values",
                    ParamSchema::string("value", ""),
                ),
            ],
        )];
        let schema = params_to_json_schema(&params);
        let filter = &schema["properties"]["filter"];
        assert_eq!(filter["type"], "object");
        assert_eq!(filter["properties"]["field"]["type"], "string");
        assert_eq!(filter["properties"]["values"]["items"]["type"], "string");
        assert_eq!(filter["required"], json!(["field"]));
    }
}
