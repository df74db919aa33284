//! In-memory catalogue backend.
//!
//! A reference [`Backend`] implementation holding everything in process
//! memory. It executes typed query expressions directly over the stored
//! property documents, with SQL-style three-valued logic: an undefined
//! property evaluates to null, and null propagates through operators
//! except where `and`/`or` can decide without it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use arkiv_expr::{NamespaceSchemas, TypedExpr, TypedExprKind, Value};
use chrono::{Duration, NaiveDateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::backend::{
    AggregateSpec, Backend, GroupBySpec, ReduceFn, Summary, SummaryRow, TimestampBin,
};
use crate::properties::Properties;
use crate::{Error, Result};

#[derive(Default)]
pub struct MemBackend {
    prepared: bool,
    namespace_schemas: NamespaceSchemas,
    products: BTreeMap<Uuid, Properties>,
    tags: HashMap<Uuid, BTreeSet<String>>,
    sources: HashMap<Uuid, BTreeSet<Uuid>>,
    // Deletion time of products that other products still link to.
    removed_at: HashMap<Uuid, NaiveDateTime>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn product(&self, uuid: Uuid) -> Result<&Properties> {
        self.products
            .get(&uuid)
            .ok_or_else(|| Error::User(format!("product with UUID '{uuid}' not found")))
    }

    // ------------------------------------------------------------------
    // Expression evaluation
    // ------------------------------------------------------------------

    fn evaluate(
        &self,
        expr: &TypedExpr,
        product: &Properties,
        now: NaiveDateTime,
    ) -> Result<Option<Value>> {
        match &expr.kind {
            TypedExprKind::Literal(value) => Ok(Some(value.clone())),

            TypedExprKind::Name(name) => {
                let (namespace, property) = name
                    .split_once('.')
                    .ok_or_else(|| Error::Internal(format!("unqualified name: \"{name}\"")))?;
                Ok(product.get_defined(namespace, property).cloned())
            }

            TypedExprKind::FunctionCall {
                prototype,
                arguments,
            } => match prototype.name.as_str() {
                // Three-valued logic can short-circuit around null.
                "and" => {
                    let lhs = self.evaluate_boolean(&arguments[0], product, now)?;
                    let rhs = self.evaluate_boolean(&arguments[1], product, now)?;
                    Ok(match (lhs, rhs) {
                        (Some(false), _) | (_, Some(false)) => Some(Value::Boolean(false)),
                        (Some(true), Some(true)) => Some(Value::Boolean(true)),
                        _ => None,
                    })
                }
                "or" => {
                    let lhs = self.evaluate_boolean(&arguments[0], product, now)?;
                    let rhs = self.evaluate_boolean(&arguments[1], product, now)?;
                    Ok(match (lhs, rhs) {
                        (Some(true), _) | (_, Some(true)) => Some(Value::Boolean(true)),
                        (Some(false), Some(false)) => Some(Value::Boolean(false)),
                        _ => None,
                    })
                }
                "not" => {
                    let value = self.evaluate_boolean(&arguments[0], product, now)?;
                    Ok(value.map(|b| Value::Boolean(!b)))
                }

                "is_defined" => {
                    let defined = self.evaluate(&arguments[0], product, now)?.is_some();
                    Ok(Some(Value::Boolean(defined)))
                }

                "now" => Ok(Some(Value::Timestamp(now))),

                name => {
                    let mut values = Vec::with_capacity(arguments.len());
                    for argument in arguments {
                        match self.evaluate(argument, product, now)? {
                            Some(value) => values.push(value),
                            None => return Ok(None),
                        }
                    }
                    self.apply(name, &values, product).map(Some)
                }
            },
        }
    }

    fn evaluate_boolean(
        &self,
        expr: &TypedExpr,
        product: &Properties,
        now: NaiveDateTime,
    ) -> Result<Option<bool>> {
        match self.evaluate(expr, product, now)? {
            Some(Value::Boolean(b)) => Ok(Some(b)),
            Some(other) => Err(Error::Internal(format!(
                "expected boolean operand, got '{other}'"
            ))),
            None => Ok(None),
        }
    }

    /// Apply a strict (null-free) operator or function.
    fn apply(&self, name: &str, values: &[Value], product: &Properties) -> Result<Value> {
        match (name, values) {
            ("==", [lhs, rhs]) => Ok(Value::Boolean(value_eq(lhs, rhs))),
            ("!=", [lhs, rhs]) => Ok(Value::Boolean(!value_eq(lhs, rhs))),
            ("<" | ">" | "<=" | ">=", [lhs, rhs]) => {
                let ordering = value_cmp(lhs, rhs).ok_or_else(|| {
                    Error::Internal(format!("cannot order '{lhs}' against '{rhs}'"))
                })?;
                let result = match name {
                    "<" => ordering == Ordering::Less,
                    ">" => ordering == Ordering::Greater,
                    "<=" => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                Ok(Value::Boolean(result))
            }

            ("~=", [Value::Text(text), Value::Text(pattern)]) => {
                Ok(Value::Boolean(like_match(text, pattern)?))
            }

            ("+" | "-", [value]) => match (name, value) {
                ("+", _) => Ok(value.clone()),
                ("-", Value::Integer(n)) => Ok(Value::Integer(-n)),
                ("-", Value::Real(r)) => Ok(Value::Real(-r)),
                _ => Err(Error::Internal(format!("cannot negate '{value}'"))),
            },

            ("-", [Value::Timestamp(lhs), Value::Timestamp(rhs)]) => {
                let elapsed = (*lhs - *rhs).num_microseconds().unwrap_or(i64::MAX);
                Ok(Value::Real(elapsed as f64 / 1e6))
            }

            ("+" | "-" | "*" | "/", [lhs, rhs]) => arithmetic(name, lhs, rhs),

            ("covers", [Value::Timestamp(a0), Value::Timestamp(a1), Value::Timestamp(b0), Value::Timestamp(b1)]) => {
                Ok(Value::Boolean(a0 <= b0 && a1 >= b1))
            }
            ("intersects", [Value::Timestamp(a0), Value::Timestamp(a1), Value::Timestamp(b0), Value::Timestamp(b1)]) => {
                Ok(Value::Boolean(a0 <= b1 && b0 <= a1))
            }
            ("covers" | "intersects", [Value::Geometry(_), Value::Geometry(_)]) => {
                Err(Error::User(format!(
                    "geometry operations are not supported by the in-memory catalogue: '{name}'"
                )))
            }

            ("has_tag", [Value::Text(tag)]) => {
                let uuid = product.uuid()?;
                let tagged = self
                    .tags
                    .get(&uuid)
                    .is_some_and(|tags| tags.contains(tag));
                Ok(Value::Boolean(tagged))
            }
            ("is_derived_from", [Value::Uuid(source)]) => {
                let uuid = product.uuid()?;
                let linked = self
                    .sources
                    .get(&uuid)
                    .is_some_and(|sources| sources.contains(source));
                Ok(Value::Boolean(linked))
            }
            ("is_source_of", [Value::Uuid(derived)]) => {
                let uuid = product.uuid()?;
                let linked = self
                    .sources
                    .get(derived)
                    .is_some_and(|sources| sources.contains(&uuid));
                Ok(Value::Boolean(linked))
            }

            _ => Err(Error::Internal(format!(
                "unsupported function: '{name}' with {} argument(s)",
                values.len()
            ))),
        }
    }

    fn matches(
        &self,
        where_: Option<&TypedExpr>,
        product: &Properties,
        now: NaiveDateTime,
    ) -> Result<bool> {
        match where_ {
            None => Ok(true),
            Some(expr) => Ok(self.evaluate_boolean(expr, product, now)? == Some(true)),
        }
    }

    fn select(
        &self,
        where_: Option<&TypedExpr>,
        now: NaiveDateTime,
    ) -> Result<Vec<&Properties>> {
        let mut selected = Vec::new();
        for product in self.products.values() {
            if self.matches(where_, product, now)? {
                selected.push(product);
            }
        }
        Ok(selected)
    }
}

// ======================================================================
// Value helpers
// ======================================================================

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => Some(*n as f64),
        Value::Real(r) => Some(*r),
        _ => None,
    }
}

fn value_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Real(_) | Value::Integer(_), Value::Real(_) | Value::Integer(_)) => {
            as_f64(lhs) == as_f64(rhs)
        }
        _ => lhs == rhs,
    }
}

fn value_cmp(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::Real(_) | Value::Integer(_), Value::Real(_) | Value::Integer(_)) => {
            as_f64(lhs)?.partial_cmp(&as_f64(rhs)?)
        }
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn arithmetic(operator: &str, lhs: &Value, rhs: &Value) -> Result<Value> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        let result = match operator {
            "+" => a.checked_add(*b),
            "-" => a.checked_sub(*b),
            "*" => a.checked_mul(*b),
            _ => {
                if *b == 0 {
                    return Err(Error::User("division by zero".to_string()));
                }
                a.checked_div(*b)
            }
        };
        return result
            .map(Value::Integer)
            .ok_or_else(|| Error::User("integer overflow".to_string()));
    }

    let (a, b) = match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(Error::Internal(format!(
                "cannot apply '{operator}' to '{lhs}' and '{rhs}'"
            )))
        }
    };
    let result = match operator {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        _ => a / b,
    };
    Ok(Value::Real(result))
}

/// SQL LIKE semantics: `%` matches any run, `_` matches one character.
fn like_match(text: &str, pattern: &str) -> Result<bool> {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            _ => regex.push_str(&regex::escape(&ch.to_string())),
        }
    }
    regex.push('$');
    let compiled = Regex::new(&regex)
        .map_err(|err| Error::Internal(format!("bad pattern '{pattern}': {err}")))?;
    Ok(compiled.is_match(text))
}

fn bin_value(value: &Value, bin: Option<TimestampBin>) -> Result<Value> {
    let Some(bin) = bin else {
        return Ok(value.clone());
    };
    let Value::Timestamp(ts) = value else {
        return Err(Error::User(format!(
            "timestamp binning applied to non-timestamp value '{value}'"
        )));
    };
    use chrono::Datelike;
    Ok(match bin {
        TimestampBin::Year => Value::Integer(i64::from(ts.year())),
        TimestampBin::Month => Value::Integer(i64::from(ts.month())),
        TimestampBin::YearMonth => Value::Text(format!("{:04}-{:02}", ts.year(), ts.month())),
        TimestampBin::Date => Value::Text(ts.date().format("%Y-%m-%d").to_string()),
    })
}

fn reduce(values: &[Value], reduce: ReduceFn) -> Result<Value> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    match reduce {
        ReduceFn::Min | ReduceFn::Max => {
            let mut best = &values[0];
            for value in &values[1..] {
                let ordering = value_cmp(value, best).ok_or_else(|| {
                    Error::User(format!("cannot order '{value}' against '{best}'"))
                })?;
                let better = match reduce {
                    ReduceFn::Min => ordering == Ordering::Less,
                    _ => ordering == Ordering::Greater,
                };
                if better {
                    best = value;
                }
            }
            Ok(best.clone())
        }
        ReduceFn::Sum | ReduceFn::Avg => {
            let mut sum = 0.0;
            let mut integral = true;
            for value in values {
                match value {
                    Value::Integer(n) => sum += *n as f64,
                    Value::Real(r) => {
                        integral = false;
                        sum += *r;
                    }
                    other => {
                        return Err(Error::User(format!(
                            "cannot aggregate non-numeric value '{other}'"
                        )))
                    }
                }
            }
            if reduce == ReduceFn::Avg {
                Ok(Value::Real(sum / values.len() as f64))
            } else if integral {
                Ok(Value::Integer(sum as i64))
            } else {
                Ok(Value::Real(sum))
            }
        }
    }
}

fn split_qualified(name: &str) -> (&str, &str) {
    name.split_once('.').unwrap_or(("core", name))
}

/// Order-by keys with a `+`/`-` direction prefix.
fn sort_products(products: &mut [&Properties], order_by: &[String]) {
    products.sort_by(|a, b| {
        for key in order_by {
            let (descending, name) = match key.strip_prefix('-') {
                Some(name) => (true, name),
                None => (false, key.strip_prefix('+').unwrap_or(key)),
            };
            let (namespace, property) = split_qualified(name);
            let lhs = a.get_defined(namespace, property);
            let rhs = b.get_defined(namespace, property);
            let ordering = match (lhs, rhs) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(l), Some(r)) => value_cmp(l, r).unwrap_or(Ordering::Equal),
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(
    product: &Properties,
    namespaces: &[String],
    property_names: &[String],
) -> Properties {
    let mut projected = Properties::new();
    if property_names.is_empty() {
        for (namespace, properties) in product.iter() {
            if namespace == "core" || namespaces.iter().any(|n| n == namespace) {
                for (name, value) in properties {
                    projected.set(namespace, name, value.clone());
                }
            }
        }
    } else {
        for name in property_names {
            let (namespace, property) = split_qualified(name);
            if let Some(value) = product.get(namespace, property) {
                projected.set(namespace, property, value.clone());
            }
        }
    }
    projected
}

// ======================================================================
// Backend implementation
// ======================================================================

impl Backend for MemBackend {
    fn initialize(&mut self, namespace_schemas: &NamespaceSchemas) -> Result<()> {
        self.namespace_schemas = namespace_schemas.clone();
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.prepared)
    }

    fn prepare(&mut self, dry_run: bool) -> Result<Vec<String>> {
        let report = vec!["create in-memory catalogue".to_string()];
        if !dry_run {
            self.prepared = true;
        }
        Ok(report)
    }

    fn destroy(&mut self) -> Result<()> {
        *self = MemBackend {
            namespace_schemas: std::mem::take(&mut self.namespace_schemas),
            ..MemBackend::default()
        };
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn server_time_utc(&self) -> Result<NaiveDateTime> {
        Ok(Utc::now().naive_utc())
    }

    fn insert_product_properties(&mut self, properties: &Properties) -> Result<()> {
        let uuid = properties.uuid()?;
        if self.products.contains_key(&uuid) {
            return Err(Error::User(format!("duplicate product UUID: '{uuid}'")));
        }
        if let (Some(archive_path), Some(physical_name)) =
            (properties.archive_path(), properties.physical_name())
        {
            let duplicate = self.products.values().any(|existing| {
                existing.archive_path() == Some(archive_path)
                    && existing.physical_name() == Some(physical_name)
            });
            if duplicate {
                return Err(Error::User(format!(
                    "duplicate product: '{archive_path}/{physical_name}'"
                )));
            }
        }
        self.removed_at.remove(&uuid);
        self.products.insert(uuid, properties.clone());
        Ok(())
    }

    fn update_product_properties(
        &mut self,
        properties: &Properties,
        uuid: Uuid,
        _new_namespaces: &[String],
    ) -> Result<()> {
        if let Some(Value::Uuid(other)) = properties.get_defined("core", "uuid") {
            if *other != uuid {
                return Err(Error::Internal(
                    "product UUID cannot be changed".to_string(),
                ));
            }
        }
        let product = self
            .products
            .get_mut(&uuid)
            .ok_or_else(|| Error::User(format!("product with UUID '{uuid}' not found")))?;
        for (namespace, values) in properties.iter() {
            for (name, value) in values {
                if value.is_null() {
                    product.remove(namespace, name);
                } else {
                    product.set(namespace, name, value.clone());
                }
            }
        }
        Ok(())
    }

    fn delete_product_properties(&mut self, uuid: Uuid) -> Result<()> {
        if self.products.remove(&uuid).is_none() {
            return Err(Error::User(format!("product with UUID '{uuid}' not found")));
        }
        self.tags.remove(&uuid);
        self.sources.remove(&uuid);
        // Links from derived products remain; remember when the target
        // went away so grace periods can be applied.
        if self.sources.values().any(|sources| sources.contains(&uuid)) {
            self.removed_at.insert(uuid, Utc::now().naive_utc());
        }
        Ok(())
    }

    fn search(
        &self,
        where_: Option<&TypedExpr>,
        order_by: &[String],
        limit: Option<usize>,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Vec<Properties>> {
        let now = self.server_time_utc()?;
        let mut selected = self.select(where_, now)?;
        sort_products(&mut selected, order_by);
        if let Some(limit) = limit {
            selected.truncate(limit);
        }
        Ok(selected
            .into_iter()
            .map(|product| project(product, namespaces, property_names))
            .collect())
    }

    fn count(&self, where_: Option<&TypedExpr>) -> Result<usize> {
        let now = self.server_time_utc()?;
        Ok(self.select(where_, now)?.len())
    }

    fn summary(
        &self,
        where_: Option<&TypedExpr>,
        aggregates: &[AggregateSpec],
        group_by: &[GroupBySpec],
        group_by_tag: bool,
        order_by: &[String],
    ) -> Result<Summary> {
        let now = self.server_time_utc()?;
        let selected = self.select(where_, now)?;

        let mut columns: Vec<String> = group_by
            .iter()
            .map(|spec| spec.property.clone())
            .collect();
        if group_by_tag {
            columns.push("tag".to_string());
        }
        columns.push("count".to_string());
        for spec in aggregates {
            columns.push(format!("{}.{}", spec.property, spec.reduce));
        }

        // Group key rendered through Display for map ordering; the raw
        // values are kept alongside.
        let mut groups: BTreeMap<String, (Vec<Value>, Vec<&Properties>)> = BTreeMap::new();
        for product in selected {
            let mut key = Vec::with_capacity(group_by.len() + usize::from(group_by_tag));
            for spec in group_by {
                let (namespace, property) = split_qualified(&spec.property);
                let value = match product.get_defined(namespace, property) {
                    Some(value) => bin_value(value, spec.bin)?,
                    None => Value::Null,
                };
                key.push(value);
            }
            let tags: Vec<Option<String>> = if group_by_tag {
                let uuid = product.uuid()?;
                match self.tags.get(&uuid) {
                    Some(tags) if !tags.is_empty() => {
                        tags.iter().cloned().map(Some).collect()
                    }
                    _ => vec![None],
                }
            } else {
                vec![None]
            };
            for tag in tags {
                let mut key = key.clone();
                if group_by_tag {
                    key.push(tag.map(Value::Text).unwrap_or(Value::Null));
                }
                let rendered = key
                    .iter()
                    .map(|value| value.to_string())
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                groups
                    .entry(rendered)
                    .or_insert_with(|| (key, Vec::new()))
                    .1
                    .push(product);
            }
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (_, (group, members)) in groups {
            let mut reduced = Vec::with_capacity(aggregates.len());
            for spec in aggregates {
                let (namespace, property) = split_qualified(&spec.property);
                let values: Vec<Value> = members
                    .iter()
                    .filter_map(|product| product.get_defined(namespace, property))
                    .cloned()
                    .collect();
                reduced.push(reduce(&values, spec.reduce)?);
            }
            rows.push(SummaryRow {
                group,
                count: members.len(),
                aggregates: reduced,
            });
        }

        if !order_by.is_empty() {
            rows.sort_by(|a, b| {
                for key in order_by {
                    let (descending, name) = match key.strip_prefix('-') {
                        Some(name) => (true, name),
                        None => (false, key.strip_prefix('+').unwrap_or(key)),
                    };
                    let Some(index) = columns.iter().position(|column| column == name) else {
                        continue;
                    };
                    let column_value = |row: &SummaryRow| -> Value {
                        if index < row.group.len() {
                            row.group[index].clone()
                        } else if index == row.group.len() {
                            Value::Integer(row.count as i64)
                        } else {
                            row.aggregates[index - row.group.len() - 1].clone()
                        }
                    };
                    let ordering = value_cmp(&column_value(a), &column_value(b))
                        .unwrap_or(Ordering::Equal);
                    let ordering = if descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        Ok(Summary { columns, rows })
    }

    fn tag(&mut self, uuid: Uuid, tags: &[String]) -> Result<()> {
        self.product(uuid)?;
        let entry = self.tags.entry(uuid).or_default();
        entry.extend(tags.iter().cloned());
        Ok(())
    }

    fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        self.product(uuid)?;
        match tags {
            None => {
                self.tags.remove(&uuid);
            }
            Some(tags) => {
                if let Some(entry) = self.tags.get_mut(&uuid) {
                    for tag in tags {
                        entry.remove(tag);
                    }
                }
            }
        }
        Ok(())
    }

    fn tags(&self, uuid: Uuid) -> Result<Vec<String>> {
        self.product(uuid)?;
        Ok(self
            .tags
            .get(&uuid)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn link(&mut self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()> {
        self.product(uuid)?;
        let entry = self.sources.entry(uuid).or_default();
        entry.extend(source_uuids.iter().copied());
        Ok(())
    }

    fn unlink(&mut self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        self.product(uuid)?;
        match source_uuids {
            None => {
                self.sources.remove(&uuid);
            }
            Some(source_uuids) => {
                if let Some(entry) = self.sources.get_mut(&uuid) {
                    for source in source_uuids {
                        entry.remove(source);
                    }
                }
            }
        }
        Ok(())
    }

    fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.product(uuid)?;
        Ok(self
            .sources
            .get(&uuid)
            .map(|sources| sources.iter().copied().collect())
            .unwrap_or_default())
    }

    fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.product(uuid)?;
        let mut derived: Vec<Uuid> = self
            .sources
            .iter()
            .filter(|(_, sources)| sources.contains(&uuid))
            .map(|(derived, _)| *derived)
            .collect();
        derived.sort();
        Ok(derived)
    }

    fn find_products_without_source(
        &self,
        product_type: &str,
        grace_period: Duration,
        stored_only: bool,
    ) -> Result<Vec<Properties>> {
        let now = Utc::now().naive_utc();
        let mut found = Vec::new();
        for (uuid, product) in &self.products {
            if product.product_type()? != product_type {
                continue;
            }
            if stored_only && product.archive_path().is_none() {
                continue;
            }
            let Some(sources) = self.sources.get(uuid).filter(|s| !s.is_empty()) else {
                continue;
            };
            if sources.iter().any(|s| self.products.contains_key(s)) {
                continue;
            }
            // The grace period counts from the latest known deletion.
            let expired = sources.iter().all(|s| match self.removed_at.get(s) {
                Some(removed) => now - *removed >= grace_period,
                None => true,
            });
            if expired {
                found.push(product.clone());
            }
        }
        Ok(found)
    }

    fn find_products_without_available_source(
        &self,
        product_type: &str,
    ) -> Result<Vec<Properties>> {
        let mut found = Vec::new();
        for (uuid, product) in &self.products {
            if product.product_type()? != product_type || product.archive_path().is_none() {
                continue;
            }
            let Some(sources) = self.sources.get(uuid).filter(|s| !s.is_empty()) else {
                continue;
            };
            let present: Vec<&Properties> = sources
                .iter()
                .filter_map(|s| self.products.get(s))
                .collect();
            if present.is_empty() {
                continue;
            }
            if present.iter().all(|source| source.archive_path().is_none()) {
                found.push(product.clone());
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkiv_expr::{parse_and_analyze, Parameters};
    use std::collections::HashMap as StdHashMap;

    fn schemas() -> NamespaceSchemas {
        StdHashMap::from([("core".to_string(), crate::properties::core_schema())])
    }

    fn backend_with(products: Vec<Properties>) -> MemBackend {
        let mut backend = MemBackend::new();
        backend.initialize(&schemas()).unwrap();
        backend.prepare(false).unwrap();
        for product in products {
            backend.insert_product_properties(&product).unwrap();
        }
        backend
    }

    fn product(name: &str, size: i64) -> Properties {
        let mut properties = Properties::new();
        properties.set_core("uuid", Value::Uuid(Uuid::new_v4()));
        properties.set_core("product_name", name.into());
        properties.set_core("physical_name", name.into());
        properties.set_core("product_type", "raw".into());
        properties.set_core("size", size.into());
        properties
    }

    fn compile(text: &str) -> TypedExpr {
        parse_and_analyze(text, &schemas(), &Parameters::new()).unwrap()
    }

    #[test]
    fn search_filters_orders_and_limits() {
        let backend = backend_with(vec![
            product("a", 30),
            product("b", 10),
            product("c", 20),
        ]);
        let expr = compile("size > 5");
        let results = backend
            .search(Some(&expr), &["-core.size".to_string()], Some(2), &[], &[])
            .unwrap();
        let names: Vec<&str> = results
            .iter()
            .map(|p| p.product_name().unwrap())
            .collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn undefined_property_does_not_match() {
        let mut small = product("a", 1);
        small.remove("core", "size");
        let backend = backend_with(vec![small, product("b", 10)]);

        let matched = backend.count(Some(&compile("size < 100"))).unwrap();
        assert_eq!(matched, 1);
        // not(null) is still null, not true.
        let matched = backend.count(Some(&compile("not (size < 100)"))).unwrap();
        assert_eq!(matched, 0);
        let defined = backend.count(Some(&compile("is_defined(size)"))).unwrap();
        assert_eq!(defined, 1);
    }

    #[test]
    fn like_pattern_matching() {
        let backend = backend_with(vec![product("S1_L0_20200101", 1), product("S2", 2)]);
        let matched = backend
            .count(Some(&compile("product_name ~= \"S1[_]L0[_]%\"")))
            .unwrap();
        // Brackets are literal characters, no match.
        assert_eq!(matched, 0);
        let matched = backend
            .count(Some(&compile("product_name ~= \"S1_L0_2020010_\"")))
            .unwrap();
        assert_eq!(matched, 1);
        let matched = backend
            .count(Some(&compile("product_name ~= \"S%\"")))
            .unwrap();
        assert_eq!(matched, 2);
    }

    #[test]
    fn duplicate_uuid_is_rejected() {
        let first = product("a", 1);
        let mut backend = backend_with(vec![first.clone()]);
        let err = backend.insert_product_properties(&first).unwrap_err();
        assert!(err.to_string().contains("duplicate product UUID"));
    }

    #[test]
    fn duplicate_physical_location_is_rejected() {
        let mut first = product("a", 1);
        first.set_core("archive_path", "2020/01".into());
        let mut second = product("a", 2);
        second.set_core("archive_path", "2020/01".into());
        let mut backend = backend_with(vec![first]);
        let err = backend.insert_product_properties(&second).unwrap_err();
        assert!(err.to_string().contains("duplicate product"));
    }

    #[test]
    fn update_with_null_clears_a_property() {
        let mut entry = product("a", 1);
        entry.set_core("archive_path", "2020/01".into());
        let uuid = entry.uuid().unwrap();
        let mut backend = backend_with(vec![entry]);

        let mut update = Properties::new();
        update.set_core("archive_path", Value::Null);
        backend
            .update_product_properties(&update, uuid, &[])
            .unwrap();

        let stored = backend.search(None, &[], None, &[], &[]).unwrap();
        assert_eq!(stored[0].archive_path(), None);
    }

    #[test]
    fn provenance_predicates() {
        let source = product("src", 1);
        let derived = product("der", 2);
        let source_uuid = source.uuid().unwrap();
        let derived_uuid = derived.uuid().unwrap();
        let mut backend = backend_with(vec![source, derived]);
        backend.link(derived_uuid, &[source_uuid]).unwrap();

        let parameters =
            Parameters::from([("uuid".to_string(), Value::Uuid(source_uuid))]);
        let expr =
            parse_and_analyze("is_derived_from(@uuid)", &schemas(), &parameters).unwrap();
        let results = backend.search(Some(&expr), &[], None, &[], &[]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].uuid().unwrap(), derived_uuid);

        let parameters =
            Parameters::from([("uuid".to_string(), Value::Uuid(derived_uuid))]);
        let expr = parse_and_analyze("is_source_of(@uuid)", &schemas(), &parameters).unwrap();
        let results = backend.search(Some(&expr), &[], None, &[], &[]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].uuid().unwrap(), source_uuid);
    }

    #[test]
    fn tags_and_has_tag() {
        let entry = product("a", 1);
        let uuid = entry.uuid().unwrap();
        let mut backend = backend_with(vec![entry, product("b", 2)]);
        backend.tag(uuid, &["blessed".to_string(), "raw".to_string()]).unwrap();

        let matched = backend
            .count(Some(&compile("has_tag(\"blessed\")")))
            .unwrap();
        assert_eq!(matched, 1);

        backend.untag(uuid, Some(&["blessed".to_string()])).unwrap();
        assert_eq!(backend.tags(uuid).unwrap(), vec!["raw".to_string()]);
        backend.untag(uuid, None).unwrap();
        assert!(backend.tags(uuid).unwrap().is_empty());
    }

    #[test]
    fn summary_groups_and_aggregates() {
        let mut a = product("a", 10);
        a.set_core("product_type", "raw".into());
        let mut b = product("b", 20);
        b.set_core("product_type", "raw".into());
        let mut c = product("c", 5);
        c.set_core("product_type", "l1".into());
        let backend = backend_with(vec![a, b, c]);

        let summary = backend
            .summary(
                None,
                &["core.size.sum".parse().unwrap(), "core.size.avg".parse().unwrap()],
                &["core.product_type".parse().unwrap()],
                false,
                &[],
            )
            .unwrap();

        assert_eq!(
            summary.columns,
            vec!["core.product_type", "count", "core.size.sum", "core.size.avg"]
        );
        assert_eq!(summary.rows.len(), 2);
        let raw = summary
            .rows
            .iter()
            .find(|row| row.group == vec![Value::Text("raw".to_string())])
            .unwrap();
        assert_eq!(raw.count, 2);
        assert_eq!(raw.aggregates, vec![Value::Integer(30), Value::Real(15.0)]);
    }

    #[test]
    fn orphan_detection_honors_grace_and_storage() {
        let source = product("src", 1);
        let mut stored = product("der1", 2);
        stored.set_core("archive_path", "2020/01".into());
        let bare = product("der2", 3);
        let source_uuid = source.uuid().unwrap();
        let stored_uuid = stored.uuid().unwrap();
        let bare_uuid = bare.uuid().unwrap();

        let mut backend = backend_with(vec![source, stored, bare]);
        backend.link(stored_uuid, &[source_uuid]).unwrap();
        backend.link(bare_uuid, &[source_uuid]).unwrap();

        // Source still present, nothing is orphaned.
        assert!(backend
            .find_products_without_source("raw", Duration::zero(), false)
            .unwrap()
            .is_empty());

        backend.delete_product_properties(source_uuid).unwrap();

        let orphans = backend
            .find_products_without_source("raw", Duration::zero(), false)
            .unwrap();
        assert_eq!(orphans.len(), 2);

        let stored_orphans = backend
            .find_products_without_source("raw", Duration::zero(), true)
            .unwrap();
        assert_eq!(stored_orphans.len(), 1);
        assert_eq!(stored_orphans[0].uuid().unwrap(), stored_uuid);

        // A long grace period holds everything back.
        assert!(backend
            .find_products_without_source("raw", Duration::hours(1), false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unavailable_source_detection() {
        let mut source = product("src", 1);
        source.set_core("archive_path", "2020/01".into());
        let mut derived = product("der", 2);
        derived.set_core("archive_path", "2020/02".into());
        let source_uuid = source.uuid().unwrap();
        let derived_uuid = derived.uuid().unwrap();

        let mut backend = backend_with(vec![source, derived]);
        backend.link(derived_uuid, &[source_uuid]).unwrap();

        assert!(backend
            .find_products_without_available_source("raw")
            .unwrap()
            .is_empty());

        // Strip the source: its data is gone but the entry remains.
        let mut update = Properties::new();
        update.set_core("archive_path", Value::Null);
        backend
            .update_product_properties(&update, source_uuid, &[])
            .unwrap();

        let found = backend
            .find_products_without_available_source("raw")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uuid().unwrap(), derived_uuid);
    }
}
