//! Catalogue backend contract.
//!
//! A backend persists product property documents, tags and provenance
//! links, and executes typed query expressions produced by the
//! expression engine. The archive coordinator performs parsing and
//! semantic analysis; backends only ever see a [`TypedExpr`].

use std::fmt;
use std::str::FromStr;

use arkiv_expr::{NamespaceSchemas, TypedExpr, Value};
use chrono::{Duration, NaiveDateTime};
use uuid::Uuid;

use crate::properties::Properties;
use crate::{Error, Result};

// ======================================================================
// Summary specifications
// ======================================================================

/// Reduction applied to a property within a summary group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceFn {
    Min,
    Max,
    Sum,
    Avg,
}

impl fmt::Display for ReduceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceFn::Min => "min",
            ReduceFn::Max => "max",
            ReduceFn::Sum => "sum",
            ReduceFn::Avg => "avg",
        };
        f.write_str(name)
    }
}

impl FromStr for ReduceFn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "min" => Ok(ReduceFn::Min),
            "max" => Ok(ReduceFn::Max),
            "sum" => Ok(ReduceFn::Sum),
            "avg" => Ok(ReduceFn::Avg),
            _ => Err(Error::User(format!("invalid aggregate function: '{s}'"))),
        }
    }
}

/// Binning applied to a timestamp property used as a group key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBin {
    Year,
    Month,
    YearMonth,
    Date,
}

impl FromStr for TimestampBin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "year" => Ok(TimestampBin::Year),
            "month" => Ok(TimestampBin::Month),
            "yearmonth" => Ok(TimestampBin::YearMonth),
            "date" => Ok(TimestampBin::Date),
            _ => Err(Error::User(format!("invalid timestamp binning: '{s}'"))),
        }
    }
}

/// `namespace.property.reduce` aggregate specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSpec {
    /// Fully qualified property name, `namespace.property`.
    pub property: String,
    pub reduce: ReduceFn,
}

impl FromStr for AggregateSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (property, reduce) = s.rsplit_once('.').ok_or_else(|| {
            Error::User(format!(
                "invalid aggregate: '{s}' (expected 'namespace.property.function')"
            ))
        })?;
        if !property.contains('.') {
            return Err(Error::User(format!(
                "invalid aggregate: '{s}' (property name must include its namespace)"
            )));
        }
        Ok(AggregateSpec {
            property: property.to_string(),
            reduce: reduce.parse()?,
        })
    }
}

/// `namespace.property[.binning]` group-by specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBySpec {
    /// Fully qualified property name, `namespace.property`.
    pub property: String,
    pub bin: Option<TimestampBin>,
}

impl FromStr for GroupBySpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [namespace, property] => Ok(GroupBySpec {
                property: format!("{namespace}.{property}"),
                bin: None,
            }),
            [namespace, property, bin] => Ok(GroupBySpec {
                property: format!("{namespace}.{property}"),
                bin: Some(bin.parse()?),
            }),
            _ => Err(Error::User(format!(
                "invalid group by: '{s}' (property name must include its namespace)"
            ))),
        }
    }
}

/// One group of a summary result.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// Group key values, in `group_by` order, then the tag when grouping
    /// by tag.
    pub group: Vec<Value>,
    pub count: usize,
    /// Aggregate values, in `aggregates` order. `Value::Null` for empty
    /// input.
    pub aggregates: Vec<Value>,
}

/// Summary result: column names plus one row per group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub columns: Vec<String>,
    pub rows: Vec<SummaryRow>,
}

// ======================================================================
// Backend trait
// ======================================================================

/// Persistent product catalogue.
///
/// Property mutation methods treat [`Value::Null`] as "clear the
/// property". `search`, `count` and `summary` take an optional typed
/// filter; `None` selects everything.
pub trait Backend: Send {
    /// Supply the registered namespace schemas. Called once before
    /// `prepare` or first use, and again whenever a namespace is
    /// registered.
    fn initialize(&mut self, namespace_schemas: &NamespaceSchemas) -> Result<()>;

    fn exists(&self) -> Result<bool>;

    /// Create the catalogue. With `dry_run`, report what would be done
    /// without doing it.
    fn prepare(&mut self, dry_run: bool) -> Result<Vec<String>>;

    fn destroy(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    /// Current time of the catalogue server, UTC.
    fn server_time_utc(&self) -> Result<NaiveDateTime>;

    /// Insert a new product. Fails if the UUID, or the
    /// (archive_path, physical_name) pair when defined, already exists.
    fn insert_product_properties(&mut self, properties: &Properties) -> Result<()>;

    /// Merge `properties` into the product identified by `uuid`.
    /// `new_namespaces` lists namespaces not yet attached to the product.
    fn update_product_properties(
        &mut self,
        properties: &Properties,
        uuid: Uuid,
        new_namespaces: &[String],
    ) -> Result<()>;

    /// Remove a product together with its tags. Provenance links from
    /// other products to it are kept.
    fn delete_product_properties(&mut self, uuid: Uuid) -> Result<()>;

    fn search(
        &self,
        where_: Option<&TypedExpr>,
        order_by: &[String],
        limit: Option<usize>,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Vec<Properties>>;

    fn count(&self, where_: Option<&TypedExpr>) -> Result<usize>;

    fn summary(
        &self,
        where_: Option<&TypedExpr>,
        aggregates: &[AggregateSpec],
        group_by: &[GroupBySpec],
        group_by_tag: bool,
        order_by: &[String],
    ) -> Result<Summary>;

    fn tag(&mut self, uuid: Uuid, tags: &[String]) -> Result<()>;

    /// Remove the given tags, or all tags when `tags` is `None`.
    fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()>;

    fn tags(&self, uuid: Uuid) -> Result<Vec<String>>;

    fn link(&mut self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()>;

    /// Remove the given source links, or all of them when `None`.
    fn unlink(&mut self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()>;

    fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>>;

    fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>>;

    /// Products of `product_type` whose sources have all disappeared
    /// from the catalogue at least `grace_period` ago. With
    /// `stored_only`, restrict to products that still have stored data.
    fn find_products_without_source(
        &self,
        product_type: &str,
        grace_period: Duration,
        stored_only: bool,
    ) -> Result<Vec<Properties>>;

    /// Stored products of `product_type` that still have sources in the
    /// catalogue, none of which has stored data left.
    fn find_products_without_available_source(
        &self,
        product_type: &str,
    ) -> Result<Vec<Properties>>;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Backend")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_spec_parses_property_and_reduce() {
        let spec: AggregateSpec = "core.size.sum".parse().unwrap();
        assert_eq!(spec.property, "core.size");
        assert_eq!(spec.reduce, ReduceFn::Sum);
    }

    #[test]
    fn aggregate_spec_requires_namespace() {
        assert!("size.sum".parse::<AggregateSpec>().is_err());
        assert!("core.size.median".parse::<AggregateSpec>().is_err());
    }

    #[test]
    fn group_by_spec_parses_optional_binning() {
        let plain: GroupBySpec = "core.product_type".parse().unwrap();
        assert_eq!(plain.property, "core.product_type");
        assert_eq!(plain.bin, None);

        let binned: GroupBySpec = "core.validity_start.yearmonth".parse().unwrap();
        assert_eq!(binned.property, "core.validity_start");
        assert_eq!(binned.bin, Some(TimestampBin::YearMonth));
    }
}
