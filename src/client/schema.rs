//! Endpoint discovery from the API's swagger document

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::ClientError;

const PARAMETER_REF_PREFIX: &str = "#/parameters/";

/// One query parameter an endpoint accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub name: String,
    /// Swagger parameter location (`query` for row filters)
    pub location: String,
    pub description: Option<String>,
    pub required: bool,
}

impl FilterSpec {
    fn from_json(value: &Value) -> Result<Self, ClientError> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ClientError::InvalidSchema(format!("parameter without a name: {}", value))
            })?;

        Ok(Self {
            name: name.to_string(),
            location: value
                .get("in")
                .and_then(Value::as_str)
                .unwrap_or("query")
                .to_string(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            required: value.get("required").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// A queryable endpoint and the filters it declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub path: String,
    pub filters: Vec<FilterSpec>,
}

impl Endpoint {
    /// Names of the valid filters, in declaration order
    pub fn filter_names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name.clone()).collect()
    }

    /// Whether `name` is a valid filter of this endpoint
    pub fn accepts(&self, name: &str) -> bool {
        self.filters.iter().any(|f| f.name == name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request builder for {} endpoint\nValid filters are {}",
            self.name,
            self.filter_names().join(", ")
        )
    }
}

/// All endpoints published by the API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSchema {
    endpoints: BTreeMap<String, Endpoint>,
}

impl EndpointSchema {
    /// Build the registry from a swagger 2 document
    ///
    /// The root path `/` is not an endpoint. Parameters are either inline
    /// objects or `{"$ref": "#/parameters/<key>"}`; header and body
    /// parameters are not filters and are left out.
    pub fn parse(doc: &Value) -> Result<Self, ClientError> {
        let paths = doc
            .get("paths")
            .and_then(Value::as_object)
            .ok_or_else(|| ClientError::InvalidSchema("document has no paths object".to_string()))?;

        let mut endpoints = BTreeMap::new();
        for (path, item) in paths {
            if path == "/" {
                continue;
            }
            let Some(get) = item.get("get") else {
                continue;
            };

            let params = match get.get("parameters") {
                Some(Value::Array(params)) => params.as_slice(),
                Some(_) => {
                    return Err(ClientError::InvalidSchema(format!(
                        "parameters of {} is not an array",
                        path
                    )));
                }
                None => &[],
            };

            let mut filters = Vec::new();
            for param in params {
                let spec = FilterSpec::from_json(resolve_parameter(doc, param)?)?;
                if spec.location == "header" || spec.location == "body" {
                    continue;
                }
                filters.push(spec);
            }

            let name = path.trim_matches('/').to_string();
            endpoints.insert(
                name.clone(),
                Endpoint {
                    name,
                    path: path.clone(),
                    filters,
                },
            );
        }

        Ok(Self { endpoints })
    }

    /// Look up an endpoint by name
    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    /// Endpoint names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

fn resolve_parameter<'d>(doc: &'d Value, param: &'d Value) -> Result<&'d Value, ClientError> {
    let Some(reference) = param.get("$ref") else {
        return Ok(param);
    };

    let key = reference
        .as_str()
        .and_then(|r| r.strip_prefix(PARAMETER_REF_PREFIX))
        .ok_or_else(|| {
            ClientError::InvalidSchema(format!(
                "unsupported parameter reference {} (expected {}<key>)",
                reference, PARAMETER_REF_PREFIX
            ))
        })?;

    doc.get("parameters")
        .and_then(|p| p.get(key))
        .ok_or_else(|| {
            ClientError::InvalidSchema(format!("unresolved parameter reference {}", key))
        })
}
