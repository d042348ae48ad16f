//! Query parameters and the checkpoints that carry them.
//!
//! A `QueryCheckpoint` is the resumable state of a query: either the original
//! parameters (for a `CREATE` task) or incremental paging state written by an
//! executor. The parameters round-trip losslessly through the property map,
//! dates included.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::keys::QueryKey;

/// Property holding the query string.
pub const QUERY: &str = "query";
/// Property holding the query logic name.
pub const QUERY_LOGIC: &str = "logicName";
/// Property holding the optional query name.
pub const QUERY_NAME: &str = "queryName";
/// Property holding the formatted begin date.
pub const BEGIN_DATE: &str = "begin";
/// Property holding the formatted end date.
pub const END_DATE: &str = "end";
/// Property holding the authorizations as a list of strings.
pub const AUTHORIZATIONS: &str = "auths";
/// Property holding the optional page size.
pub const PAGE_SIZE: &str = "pagesize";
/// Property holding the free-form parameters as an object of strings.
pub const PARAMETERS: &str = "params";

/// Date layout used for stored begin/end dates (millisecond precision).
pub const DATE_FORMAT: &str = "%Y%m%d %H%M%S%.3f";

/// Errors raised when a checkpoint cannot be read back as query parameters.
#[derive(Debug, Error, PartialEq)]
pub enum CheckpointError {
    #[error("Checkpoint property '{0}' is missing")]
    MissingProperty(&'static str),

    #[error("Checkpoint property '{key}' is invalid: {message}")]
    InvalidProperty { key: String, message: String },

    #[error("Invalid query parameters: {0}")]
    Invalid(String),
}

/// Formats a date the way checkpoints store it.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parses a date written by [`format_date`].
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT).map(|naive| naive.and_utc())
}

/// The opaque parameters a client submits with a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameters {
    /// The query string (not interpreted here).
    pub query: String,
    /// Name of the query logic.
    pub query_logic: String,
    /// Optional human readable name.
    #[serde(default)]
    pub query_name: Option<String>,
    /// Start of the queried time range.
    pub begin_date: DateTime<Utc>,
    /// End of the queried time range.
    pub end_date: DateTime<Utc>,
    /// Authorizations the query runs with.
    #[serde(default)]
    pub authorizations: BTreeSet<String>,
    /// Requested page size.
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Additional free-form parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl QueryParameters {
    /// Creates parameters for a query over `[begin_date, end_date]`.
    ///
    /// Dates are truncated to millisecond precision so that they survive the
    /// checkpoint round trip unchanged.
    pub fn new(
        query: impl Into<String>,
        query_logic: impl Into<String>,
        begin_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            query: query.into(),
            query_logic: query_logic.into(),
            query_name: None,
            begin_date: begin_date.trunc_subsecs(3),
            end_date: end_date.trunc_subsecs(3),
            authorizations: BTreeSet::new(),
            page_size: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the query name.
    pub fn with_query_name(mut self, name: impl Into<String>) -> Self {
        self.query_name = Some(name.into());
        self
    }

    /// Adds authorizations.
    pub fn with_authorizations<I, S>(mut self, auths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorizations.extend(auths.into_iter().map(Into::into));
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Adds a free-form parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Checks the parameters are usable for a new query.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.query.trim().is_empty() {
            return Err(CheckpointError::Invalid("query cannot be empty".to_string()));
        }
        if self.query_logic.trim().is_empty() {
            return Err(CheckpointError::Invalid(
                "query_logic cannot be empty".to_string(),
            ));
        }
        if self.begin_date > self.end_date {
            return Err(CheckpointError::Invalid(format!(
                "begin_date {} is after end_date {}",
                format_date(&self.begin_date),
                format_date(&self.end_date)
            )));
        }
        if self.page_size == Some(0) {
            return Err(CheckpointError::Invalid(
                "page_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes the parameters as checkpoint properties.
    pub fn to_properties(&self) -> BTreeMap<String, Value> {
        let mut props = BTreeMap::new();
        props.insert(QUERY.to_string(), Value::String(self.query.clone()));
        props.insert(
            QUERY_LOGIC.to_string(),
            Value::String(self.query_logic.clone()),
        );
        if let Some(ref name) = self.query_name {
            props.insert(QUERY_NAME.to_string(), Value::String(name.clone()));
        }
        props.insert(
            BEGIN_DATE.to_string(),
            Value::String(format_date(&self.begin_date)),
        );
        props.insert(
            END_DATE.to_string(),
            Value::String(format_date(&self.end_date)),
        );
        props.insert(
            AUTHORIZATIONS.to_string(),
            Value::Array(
                self.authorizations
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        if let Some(page_size) = self.page_size {
            props.insert(PAGE_SIZE.to_string(), Value::from(page_size));
        }
        props.insert(
            PARAMETERS.to_string(),
            Value::Object(
                self.parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        props
    }

    /// Reconstructs parameters from checkpoint properties.
    pub fn from_properties(props: &BTreeMap<String, Value>) -> Result<Self, CheckpointError> {
        let query = required_str(props, QUERY)?.to_string();
        let query_logic = required_str(props, QUERY_LOGIC)?.to_string();
        let query_name = optional_str(props, QUERY_NAME)?.map(str::to_string);
        let begin_date = required_date(props, BEGIN_DATE)?;
        let end_date = required_date(props, END_DATE)?;

        let authorizations = match props.get(AUTHORIZATIONS) {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(AUTHORIZATIONS, "expected a list of strings"))
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(invalid(AUTHORIZATIONS, "expected a list of strings")),
        };

        let page_size = match props.get(PAGE_SIZE) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| invalid(PAGE_SIZE, "expected an unsigned 32-bit integer"))?,
            ),
        };

        let parameters = match props.get(PARAMETERS) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|s| (k.clone(), s.to_string()))
                        .ok_or_else(|| invalid(PARAMETERS, "expected string values"))
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(invalid(PARAMETERS, "expected an object")),
        };

        Ok(Self {
            query,
            query_logic,
            query_name,
            begin_date,
            end_date,
            authorizations,
            page_size,
            parameters,
        })
    }
}

fn invalid(key: &str, message: &str) -> CheckpointError {
    CheckpointError::InvalidProperty {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn required_str<'a>(
    props: &'a BTreeMap<String, Value>,
    key: &'static str,
) -> Result<&'a str, CheckpointError> {
    optional_str(props, key)?.ok_or(CheckpointError::MissingProperty(key))
}

fn optional_str<'a>(
    props: &'a BTreeMap<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, CheckpointError> {
    match props.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(invalid(key, "expected a string")),
    }
}

fn required_date(
    props: &BTreeMap<String, Value>,
    key: &'static str,
) -> Result<DateTime<Utc>, CheckpointError> {
    let raw = required_str(props, key)?;
    parse_date(raw).map_err(|e| CheckpointError::InvalidProperty {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Serialized, resumable state of a query at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCheckpoint {
    /// The query this checkpoint belongs to.
    pub query_key: QueryKey,
    /// Ordered checkpoint properties.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl QueryCheckpoint {
    pub fn new(query_key: QueryKey, properties: BTreeMap<String, Value>) -> Self {
        Self {
            query_key,
            properties,
        }
    }

    /// A checkpoint with no properties.
    pub fn empty(query_key: QueryKey) -> Self {
        Self::new(query_key, BTreeMap::new())
    }

    /// The initial checkpoint of a query: its original parameters.
    pub fn from_parameters(query_key: QueryKey, params: &QueryParameters) -> Self {
        Self::new(query_key, params.to_properties())
    }

    /// Reads the original query parameters back out of the checkpoint.
    pub fn to_parameters(&self) -> Result<QueryParameters, CheckpointError> {
        QueryParameters::from_properties(&self.properties)
    }

    /// Adds or replaces a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Properties rendered as strings, for display.
    pub fn string_properties(&self) -> BTreeMap<String, String> {
        self.properties
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }
}
