//! Stand-in for the `proxmox-schema` crate, covering only the API
//! surface the metadump workspace uses: the schema value types the
//! `#[api]` macro expands to, string-to-value conversion for CLI
//! parameters, and the macro re-export itself.

use anyhow::{bail, format_err, Error};
use serde_json::Value;

#[cfg(feature = "api-macro")]
pub use proxmox_api_macro::api;

/// One entry of an [`ApiStringFormat::Enum`] value list.
#[derive(Clone, Copy, Debug)]
pub struct EnumEntry {
    pub value: &'static str,
    pub description: &'static str,
}

impl EnumEntry {
    pub const fn new(value: &'static str, description: &'static str) -> Self {
        Self { value, description }
    }
}

/// Format restriction on a string schema.
#[derive(Clone, Copy, Debug)]
pub enum ApiStringFormat {
    /// Value has to be any of the listed entries.
    Enum(&'static [EnumEntry]),
}

/// Boolean parameter schema.
#[derive(Clone, Copy, Debug)]
pub struct BooleanSchema {
    pub description: &'static str,
    pub default: Option<bool>,
}

impl BooleanSchema {
    pub const fn new(description: &'static str) -> Self {
        Self {
            description,
            default: None,
        }
    }

    pub const fn default(mut self, default: bool) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn schema(self) -> Schema {
        Schema::Boolean(self)
    }
}

/// Integer parameter schema.
#[derive(Clone, Copy, Debug)]
pub struct IntegerSchema {
    pub description: &'static str,
    pub default: Option<isize>,
    pub minimum: Option<isize>,
    pub maximum: Option<isize>,
}

impl IntegerSchema {
    pub const fn new(description: &'static str) -> Self {
        Self {
            description,
            default: None,
            minimum: None,
            maximum: None,
        }
    }

    pub const fn default(mut self, default: isize) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn minimum(mut self, minimum: isize) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub const fn maximum(mut self, maximum: isize) -> Self {
        self.maximum = Some(maximum);
        self
    }

    pub const fn schema(self) -> Schema {
        Schema::Integer(self)
    }

    fn check_constraints(&self, value: isize) -> Result<(), Error> {
        if let Some(minimum) = self.minimum {
            if value < minimum {
                bail!("value must have a minimum value of {}", minimum);
            }
        }
        if let Some(maximum) = self.maximum {
            if value > maximum {
                bail!("value must have a maximum value of {}", maximum);
            }
        }
        Ok(())
    }
}

/// String parameter schema.
#[derive(Clone, Copy, Debug)]
pub struct StringSchema {
    pub description: &'static str,
    pub default: Option<&'static str>,
    pub format: Option<&'static ApiStringFormat>,
}

impl StringSchema {
    pub const fn new(description: &'static str) -> Self {
        Self {
            description,
            default: None,
            format: None,
        }
    }

    pub const fn default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn format(mut self, format: &'static ApiStringFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub const fn schema(self) -> Schema {
        Schema::String(self)
    }

    fn check_constraints(&self, value: &str) -> Result<(), Error> {
        if let Some(ApiStringFormat::Enum(entries)) = self.format {
            if !entries.iter().any(|entry| entry.value == value) {
                bail!("value '{}' is not defined in the enumeration.", value);
            }
        }
        Ok(())
    }
}

/// Property list of an object schema: `(name, optional, schema)`,
/// sorted by name.
pub type SchemaPropertyMap = &'static [(&'static str, bool, &'static Schema)];

/// Object schema describing a parameter set.
#[derive(Clone, Copy, Debug)]
pub struct ObjectSchema {
    pub description: &'static str,
    pub additional_properties: bool,
    pub properties: SchemaPropertyMap,
}

impl ObjectSchema {
    pub const fn new(description: &'static str, properties: SchemaPropertyMap) -> Self {
        Self {
            description,
            additional_properties: false,
            properties,
        }
    }

    pub const fn additional_properties(mut self, additional_properties: bool) -> Self {
        self.additional_properties = additional_properties;
        self
    }

    pub const fn schema(self) -> Schema {
        Schema::Object(self)
    }

    /// Find a property by name; returns its optional flag and schema.
    pub fn lookup(&self, name: &str) -> Option<(bool, &Schema)> {
        self.properties
            .iter()
            .find(|(prop_name, _, _)| *prop_name == name)
            .map(|(_, optional, schema)| (*optional, *schema))
    }
}

/// Parameter schema variants used by the metadump CLI.
#[derive(Clone, Copy, Debug)]
pub enum Schema {
    Null,
    Boolean(BooleanSchema),
    Integer(IntegerSchema),
    String(StringSchema),
    Object(ObjectSchema),
}

impl Schema {
    /// The description of the schema, used for help output.
    pub fn description(&self) -> &'static str {
        match self {
            Schema::Null => "",
            Schema::Boolean(schema) => schema.description,
            Schema::Integer(schema) => schema.description,
            Schema::String(schema) => schema.description,
            Schema::Object(schema) => schema.description,
        }
    }

    /// Short type name, used for help output.
    pub fn type_text(&self) -> &'static str {
        match self {
            Schema::Null => "<null>",
            Schema::Boolean(_) => "<boolean>",
            Schema::Integer(_) => "<integer>",
            Schema::String(_) => "<string>",
            Schema::Object(_) => "<object>",
        }
    }
}

/// Parse a boolean string the way the proxmox CLI does.
pub fn parse_boolean(value_str: &str) -> Result<bool, Error> {
    match value_str.to_lowercase().as_str() {
        "1" | "on" | "yes" | "true" => Ok(true),
        "0" | "off" | "no" | "false" => Ok(false),
        _ => bail!("Unable to parse boolean option."),
    }
}

/// Convert one raw string value into the JSON value its schema
/// prescribes.
pub fn parse_simple_value(value_str: &str, schema: &Schema) -> Result<Value, Error> {
    Ok(match schema {
        Schema::Null => bail!("internal error - found Null schema"),
        Schema::Boolean(_) => Value::Bool(parse_boolean(value_str)?),
        Schema::Integer(integer_schema) => {
            let value: isize = value_str
                .parse()
                .map_err(|_| format_err!("Unable to parse integer value."))?;
            integer_schema.check_constraints(value)?;
            Value::Number((value as i64).into())
        }
        Schema::String(string_schema) => {
            string_schema.check_constraints(value_str)?;
            Value::String(value_str.to_owned())
        }
        Schema::Object(_) => bail!("internal error - found Object schema"),
    })
}

/// Verification failure carrying one message per offending parameter.
#[derive(Debug, Default)]
pub struct ParameterError {
    error_list: Vec<Error>,
}

impl ParameterError {
    pub fn new() -> Self {
        Self {
            error_list: Vec::new(),
        }
    }

    pub fn push(&mut self, name: String, value: Error) {
        self.error_list
            .push(format_err!("parameter '{}': {}", name, value));
    }

    pub fn len(&self) -> usize {
        self.error_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.error_list.is_empty()
    }
}

impl std::error::Error for ParameterError {}

impl std::fmt::Display for ParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut msg = String::new();
        if !self.is_empty() {
            msg.push_str("parameter verification errors\n\n");
        }
        for item in self.error_list.iter() {
            msg.push_str(&format!("{}\n", item));
        }
        write!(f, "{}", msg)
    }
}

/// Convert a list of raw `(name, value)` parameter strings into the
/// JSON object their object schema prescribes. With `test_required`
/// set, missing non-optional properties are reported as errors.
pub fn parse_parameter_strings(
    data: &[(String, String)],
    schema: &ObjectSchema,
    test_required: bool,
) -> Result<Value, ParameterError> {
    let mut params = serde_json::Map::new();
    let mut errors = ParameterError::new();

    for (key, value) in data {
        match schema.lookup(key) {
            Some((_optional, prop_schema)) => match parse_simple_value(value, prop_schema) {
                Ok(value) => {
                    params.insert(key.clone(), value);
                }
                Err(err) => errors.push(key.clone(), err),
            },
            None => {
                if schema.additional_properties {
                    params.insert(key.clone(), Value::String(value.clone()));
                } else {
                    errors.push(key.clone(), format_err!("schema does not allow additional properties."));
                }
            }
        }
    }

    if test_required && errors.is_empty() {
        for (name, optional, _) in schema.properties {
            if !optional && !params.contains_key(*name) {
                errors.push(name.to_string(), format_err!("parameter is missing and it is not optional."));
            }
        }
    }

    if errors.is_empty() {
        Ok(Value::Object(params))
    } else {
        Err(errors)
    }
}
