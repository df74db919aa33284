//! The archive coordinator.
//!
//! An [`Archive`] combines a catalogue backend, a storage backend, and a
//! set of product type plugins into one consistent product lifecycle:
//! ingest, search, retrieve, export, strip, remove, pull. Products are
//! only visible to other operations once `core.active` is true;
//! activation is the commit point of every multi-step mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use arkiv_expr::{parse_and_analyze, DataType, Parameters, TypedExpr, Value};
use chrono::Duration;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{AggregateSpec, Backend, GroupBySpec, Summary};
use crate::config::ArchiveConfig;
use crate::plugin::{CascadeRule, ProductTypePlugin, RemoteBackend};
use crate::properties::{core_schema, Properties};
use crate::storage::Storage;
use crate::util;
use crate::{Error, Result};

static NAMESPACE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][_a-z]*(\.[a-z][_a-z]*)*$").expect("valid namespace name pattern")
});

/// Lifecycle fields owned by the coordinator. Plugins cannot override
/// these through `analyze` or property rebuilds.
const CONTROLLED_CORE_PROPERTIES: [&str; 9] = [
    "uuid",
    "active",
    "hash",
    "size",
    "metadata_date",
    "archive_date",
    "archive_path",
    "product_type",
    "physical_name",
];

/// Options for [`Archive::ingest`].
#[derive(Clone)]
pub struct IngestOptions {
    /// Product type; identified from the data when absent.
    pub product_type: Option<String>,
    /// Properties to use instead of running the plugin's `analyze`.
    pub properties: Option<Properties>,
    /// Store the product data; `false` catalogues only.
    pub ingest_product: bool,
    /// Override the archive-wide symlink setting.
    pub use_symlinks: Option<bool>,
    /// Verify the stored data against the computed hash.
    pub verify_hash: bool,
    /// The data is already at its archive location; record it in place.
    pub use_current_path: bool,
    /// Replace an existing product with the same type and name.
    pub force: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            product_type: None,
            properties: None,
            ingest_product: true,
            use_symlinks: None,
            verify_hash: false,
            use_current_path: false,
            force: false,
        }
    }
}

pub struct Archive {
    root: PathBuf,
    use_symlinks: bool,
    cascade_grace_period: Duration,
    max_cascade_cycles: u32,
    external_archives: Vec<String>,
    auth_file: Option<PathBuf>,
    namespace_schemas: arkiv_expr::NamespaceSchemas,
    product_type_plugins: BTreeMap<String, Arc<dyn ProductTypePlugin>>,
    remote_backend_plugins: BTreeMap<String, Arc<dyn RemoteBackend>>,
    backend: Box<dyn Backend>,
    storage: Box<dyn Storage>,
}

impl Archive {
    pub fn new(
        config: &ArchiveConfig,
        mut backend: Box<dyn Backend>,
        storage: Box<dyn Storage>,
    ) -> Result<Self> {
        let mut namespace_schemas = arkiv_expr::NamespaceSchemas::new();
        namespace_schemas.insert("core".to_string(), core_schema());
        backend.initialize(&namespace_schemas)?;
        Ok(Self {
            root: config.root.clone(),
            use_symlinks: config.use_symlinks,
            cascade_grace_period: Duration::minutes(config.cascade_grace_period),
            max_cascade_cycles: config.max_cascade_cycles,
            external_archives: config.external_archives.clone(),
            auth_file: config.auth_file.clone(),
            namespace_schemas,
            product_type_plugins: BTreeMap::new(),
            remote_backend_plugins: BTreeMap::new(),
            backend,
            storage,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn auth_file(&self) -> Option<&Path> {
        self.auth_file.as_deref()
    }

    pub fn external_archives(&self) -> &[String] {
        &self.external_archives
    }

    pub fn generate_uuid() -> Uuid {
        Uuid::new_v4()
    }

    // ==================================================================
    // Registration
    // ==================================================================

    pub fn register_namespace(
        &mut self,
        name: &str,
        schema: arkiv_expr::NamespaceSchema,
    ) -> Result<()> {
        if !NAMESPACE_NAME_RE.is_match(name) {
            return Err(Error::User(format!("invalid namespace name: '{name}'")));
        }
        if self.namespace_schemas.contains_key(name) {
            return Err(Error::User(format!("namespace '{name}' already registered")));
        }
        self.namespace_schemas.insert(name.to_string(), schema);
        self.backend.initialize(&self.namespace_schemas)
    }

    pub fn namespace_schema(&self, name: &str) -> Result<&arkiv_expr::NamespaceSchema> {
        self.namespace_schemas
            .get(name)
            .ok_or_else(|| Error::User(format!("undefined namespace: '{name}'")))
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespace_schemas.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn register_product_type(
        &mut self,
        name: &str,
        plugin: Arc<dyn ProductTypePlugin>,
    ) -> Result<()> {
        if self.product_type_plugins.contains_key(name) {
            return Err(Error::User(format!(
                "product type '{name}' already registered"
            )));
        }
        self.product_type_plugins.insert(name.to_string(), plugin);
        Ok(())
    }

    pub fn product_types(&self) -> Vec<String> {
        self.product_type_plugins.keys().cloned().collect()
    }

    pub fn product_type_plugin(&self, product_type: &str) -> Result<Arc<dyn ProductTypePlugin>> {
        self.product_type_plugins
            .get(product_type)
            .cloned()
            .ok_or_else(|| Error::User(format!("unregistered product type: '{product_type}'")))
    }

    pub fn register_remote_backend(
        &mut self,
        name: &str,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<()> {
        if self.remote_backend_plugins.contains_key(name) {
            return Err(Error::User(format!(
                "remote backend '{name}' already registered"
            )));
        }
        self.remote_backend_plugins.insert(name.to_string(), backend);
        Ok(())
    }

    pub fn remote_backends(&self) -> Vec<String> {
        self.remote_backend_plugins.keys().cloned().collect()
    }

    pub fn remote_backend(&self, name: &str) -> Result<Arc<dyn RemoteBackend>> {
        self.remote_backend_plugins.get(name).cloned().ok_or_else(|| {
            let available: Vec<String> = self
                .remote_backend_plugins
                .keys()
                .map(|name| format!("'{name}'"))
                .collect();
            Error::User(format!(
                "unknown remote backend: '{name}'; available: {}",
                available.join(", ")
            ))
        })
    }

    fn remote_backend_for_url(&self, url: &str) -> Result<Arc<dyn RemoteBackend>> {
        self.remote_backend_plugins
            .values()
            .find(|backend| backend.supports(url))
            .cloned()
            .ok_or_else(|| Error::User(format!("no remote backend available for URL '{url}'")))
    }

    /// Export formats supported across all registered product types.
    pub fn export_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self
            .product_type_plugins
            .values()
            .flat_map(|plugin| plugin.export_formats())
            .collect();
        formats.sort();
        formats.dedup();
        formats
    }

    // ==================================================================
    // Lifecycle of the archive itself
    // ==================================================================

    pub fn prepare(&mut self, force: bool) -> Result<()> {
        if !force && (self.backend.exists()? || self.storage.exists()?) {
            return Err(Error::User(
                "archive already exists (use force to re-create it)".to_string(),
            ));
        }
        if force {
            self.destroy()?;
        }
        self.storage.prepare()?;
        self.backend.prepare(false)?;
        Ok(())
    }

    pub fn prepare_catalogue(&mut self, dry_run: bool) -> Result<Vec<String>> {
        self.backend.prepare(dry_run)
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.destroy_catalogue()?;
        self.storage.destroy()
    }

    pub fn destroy_catalogue(&mut self) -> Result<()> {
        self.backend.destroy()
    }

    pub fn close(&mut self) -> Result<()> {
        self.backend.disconnect()
    }

    // ==================================================================
    // Query
    // ==================================================================

    fn compile(&self, where_: &str, parameters: &Parameters) -> Result<Option<TypedExpr>> {
        if where_.trim().is_empty() {
            return Ok(None);
        }
        let typed = parse_and_analyze(where_, &self.namespace_schemas, parameters)?;
        if typed.data_type != DataType::Boolean {
            return Err(Error::User(
                "product filter should be an expression of type boolean".to_string(),
            ));
        }
        Ok(Some(typed))
    }

    pub fn search(
        &self,
        where_: &str,
        order_by: &[String],
        limit: Option<usize>,
        parameters: &Parameters,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Vec<Properties>> {
        let filter = self.compile(where_, parameters)?;
        self.backend
            .search(filter.as_ref(), order_by, limit, namespaces, property_names)
    }

    pub fn count(&self, where_: &str, parameters: &Parameters) -> Result<usize> {
        let filter = self.compile(where_, parameters)?;
        self.backend.count(filter.as_ref())
    }

    /// Aggregate statistics over matching products. Aggregate and group
    /// specifications use `namespace.property.function` and
    /// `namespace.property[.binning]` notation.
    pub fn summary(
        &self,
        where_: &str,
        parameters: &Parameters,
        aggregates: &[String],
        group_by: &[String],
        group_by_tag: bool,
        order_by: &[String],
    ) -> Result<Summary> {
        let filter = self.compile(where_, parameters)?;
        let aggregates: Vec<AggregateSpec> = aggregates
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<_>>()?;
        let group_by: Vec<GroupBySpec> = group_by
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<_>>()?;
        self.backend
            .summary(filter.as_ref(), &aggregates, &group_by, group_by_tag, order_by)
    }

    fn product_by_uuid(&self, uuid: Uuid) -> Result<Properties> {
        let parameters = Parameters::from([("uuid".to_string(), Value::Uuid(uuid))]);
        let namespaces = self.namespaces();
        let mut products =
            self.search("uuid == @uuid", &[], None, &parameters, &namespaces, &[])?;
        products
            .pop()
            .ok_or_else(|| Error::User(format!("product with UUID '{uuid}' not found")))
    }

    fn product_by_name(&self, product_name: &str) -> Result<Properties> {
        let parameters = Parameters::from([(
            "product_name".to_string(),
            Value::Text(product_name.to_string()),
        )]);
        let namespaces = self.namespaces();
        let mut products = self.search(
            "product_name == @product_name",
            &[],
            None,
            &parameters,
            &namespaces,
            &[],
        )?;
        match products.len() {
            0 => Err(Error::User(format!("product '{product_name}' not found"))),
            1 => Ok(products.pop().expect("one product")),
            _ => Err(Error::User(format!(
                "more than one product named '{product_name}'"
            ))),
        }
    }

    /// Full property document of a product, optionally restricted to the
    /// given namespaces (besides `core`).
    pub fn retrieve_properties(
        &self,
        uuid: Uuid,
        namespaces: Option<&[String]>,
    ) -> Result<Properties> {
        let parameters = Parameters::from([("uuid".to_string(), Value::Uuid(uuid))]);
        let namespaces = match namespaces {
            Some(namespaces) => namespaces.to_vec(),
            None => self.namespaces(),
        };
        let mut products =
            self.search("uuid == @uuid", &[], None, &parameters, &namespaces, &[])?;
        products
            .pop()
            .ok_or_else(|| Error::User(format!("product with UUID '{uuid}' not found")))
    }

    // ==================================================================
    // Property mutation
    // ==================================================================

    /// Insert a catalogue-only product entry. Generates a UUID and marks
    /// the entry inactive unless the document says otherwise; sets
    /// `core.metadata_date`.
    pub fn create_properties(&mut self, properties: &mut Properties) -> Result<()> {
        self.check_namespaces(properties)?;
        if properties.uuid().is_err() {
            properties.set_core("uuid", Value::Uuid(Uuid::new_v4()));
        }
        if properties.get("core", "active").is_none() {
            properties.set_core("active", Value::Boolean(false));
        }
        let metadata_date = self.backend.server_time_utc()?;
        properties.set_core("metadata_date", Value::Timestamp(metadata_date));
        self.backend.insert_product_properties(properties)
    }

    /// Merge a partial property document into an existing product.
    /// `Value::Null` clears a property. With `create_namespaces`,
    /// namespaces not yet attached to the product are added. Updates
    /// `core.metadata_date` as a side effect, in the document too.
    pub fn update_properties(
        &mut self,
        properties: &mut Properties,
        uuid: Option<Uuid>,
        create_namespaces: bool,
    ) -> Result<()> {
        self.check_namespaces(properties)?;
        let uuid = match (uuid, properties.uuid().ok()) {
            (Some(uuid), Some(own)) if uuid != own => {
                return Err(Error::User(
                    "UUID in property document does not match the product UUID".to_string(),
                ))
            }
            (Some(uuid), _) => uuid,
            (None, Some(own)) => own,
            (None, None) => {
                return Err(Error::User(
                    "no product UUID to update".to_string(),
                ))
            }
        };

        let new_namespaces: Vec<String> = if create_namespaces {
            let existing = self.product_by_uuid(uuid)?;
            properties
                .namespace_names()
                .filter(|namespace| existing.namespace(namespace).is_none())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let metadata_date = self.backend.server_time_utc()?;
        properties.set_core("metadata_date", Value::Timestamp(metadata_date));
        self.backend
            .update_product_properties(properties, uuid, &new_namespaces)
    }

    fn check_namespaces(&self, properties: &Properties) -> Result<()> {
        for namespace in properties.namespace_names() {
            if !self.namespace_schemas.contains_key(namespace) {
                return Err(Error::User(format!("undefined namespace: '{namespace}'")));
            }
        }
        Ok(())
    }

    // ==================================================================
    // Ingest
    // ==================================================================

    /// Determine the product type of the given files.
    pub fn identify(&self, paths: &[PathBuf]) -> Result<String> {
        for (name, plugin) in &self.product_type_plugins {
            if plugin.identify(paths) {
                return Ok(name.clone());
            }
        }
        Err(Error::User("unable to identify product type".to_string()))
    }

    /// Ingest product data into the archive.
    ///
    /// The catalogue entry is inserted inactive, the data transfer runs,
    /// and the entry is activated last. A failed transfer removes the
    /// entry again, so a product is either fully present or absent.
    pub fn ingest(&mut self, paths: &[PathBuf], options: &IngestOptions) -> Result<Properties> {
        if paths.is_empty() {
            return Err(Error::User("nothing to ingest".to_string()));
        }
        if !self.storage.exists()? {
            return Err(Error::User(format!(
                "archive root path '{}' does not exist",
                self.root.display()
            )));
        }
        // Absolute paths keep error messages useful and symlinked
        // ingests intact.
        let paths: Vec<PathBuf> = paths
            .iter()
            .map(std::fs::canonicalize)
            .collect::<std::io::Result<_>>()?;
        if util::contains_duplicate_basenames(&paths) {
            return Err(Error::User(
                "basenames of product files must be unique".to_string(),
            ));
        }

        let product_type = match &options.product_type {
            Some(product_type) => product_type.clone(),
            None => self.identify(&paths)?,
        };
        let plugin = self.product_type_plugin(&product_type)?;

        if paths.len() > 1 && !plugin.use_enclosing_directory() {
            return Err(Error::User(format!(
                "product type '{product_type}' does not support multi-file products"
            )));
        }

        let (mut properties, tags) = match &options.properties {
            Some(properties) => (properties.clone(), Vec::new()),
            None => {
                let analysis = plugin.analyze(&paths)?;
                (analysis.properties, analysis.tags)
            }
        };
        self.check_namespaces(&properties)?;

        let physical_name = if plugin.use_enclosing_directory() {
            plugin.enclosing_directory(&properties)?
        } else {
            util::basename(&paths[0])?
        };
        let product_name = match properties.get_defined("core", "product_name") {
            Some(Value::Text(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(Error::User(
                    "core.product_name is required in the product properties".to_string(),
                ))
            }
        };

        let uuid = properties.uuid().unwrap_or_else(|_| Uuid::new_v4());
        let metadata_date = self.backend.server_time_utc()?;
        properties.set_core("uuid", Value::Uuid(uuid));
        properties.set_core("active", Value::Boolean(false));
        properties.set_core("product_type", Value::Text(product_type.clone()));
        properties.set_core("product_name", Value::Text(product_name.clone()));
        properties.set_core("physical_name", Value::Text(physical_name));
        properties.set_core("metadata_date", Value::Timestamp(metadata_date));
        properties.set_core("size", Value::Integer(util::product_size(&paths)? as i64));
        // Known up front so the insert can reject an occupied name slot.
        if options.ingest_product && !options.use_current_path {
            properties.set_core("archive_path", Value::Text(plugin.archive_path(&properties)?));
        }

        if options.force {
            let parameters = Parameters::from([
                ("product_type".to_string(), Value::Text(product_type.clone())),
                ("product_name".to_string(), Value::Text(product_name.clone())),
            ]);
            self.remove(
                "product_type == @product_type and product_name == @product_name",
                &parameters,
                true,
            )?;
        }

        self.backend.insert_product_properties(&properties)?;

        if let Err(err) = self.ingest_data(&paths, &mut properties, plugin.as_ref(), options) {
            // The inactive entry must not outlive the failed transfer.
            if let Err(cleanup) = self.backend.delete_product_properties(uuid) {
                warn!(%uuid, error = %cleanup, "failed to roll back catalogue entry");
            }
            return Err(err);
        }

        let mut activation = Properties::new();
        activation.set_core("active", Value::Boolean(true));
        if options.ingest_product {
            let archive_date = self.backend.server_time_utc()?;
            activation.set_core("archive_date", Value::Timestamp(archive_date));
            if let Some(archive_path) = properties.archive_path() {
                activation.set_core("archive_path", Value::Text(archive_path.to_string()));
            }
        }
        if let Some(hash) = properties.hash() {
            activation.set_core("hash", Value::Text(hash.to_string()));
        }
        self.update_properties(&mut activation, Some(uuid), false)?;
        properties.merge(&activation);

        if !tags.is_empty() {
            self.backend.tag(uuid, &tags)?;
        }
        plugin.post_ingest_hook(self, &properties)?;

        info!(%uuid, product_type, product_name, "ingested product");
        Ok(properties)
    }

    fn ingest_data(
        &mut self,
        paths: &[PathBuf],
        properties: &mut Properties,
        plugin: &dyn ProductTypePlugin,
        options: &IngestOptions,
    ) -> Result<()> {
        if plugin.use_hash() {
            properties.set_core("hash", Value::Text(util::product_hash(paths)?));
        }
        if !options.ingest_product {
            return Ok(());
        }

        let use_symlinks = options.use_symlinks.unwrap_or(self.use_symlinks);
        self.storage.put(
            paths,
            properties,
            plugin,
            options.use_current_path,
            use_symlinks,
        )?;

        if options.verify_hash && plugin.use_hash() {
            let calculated = self.calculate_hash(properties, plugin)?;
            if Some(calculated.as_str()) != properties.hash() {
                return Err(Error::User(format!(
                    "ingested product has incorrect hash: {}",
                    properties.display_name()
                )));
            }
        }
        Ok(())
    }

    // ==================================================================
    // Data access
    // ==================================================================

    /// Location of a product's stored data.
    pub fn product_path(&self, product: &Properties) -> Result<PathBuf> {
        if product.archive_path().is_none() {
            return Err(Error::User(format!(
                "product {} has no data in the archive",
                product.display_name()
            )));
        }
        self.storage.product_path(product)
    }

    pub fn product_path_by_uuid(&self, uuid: Uuid) -> Result<PathBuf> {
        let product = self.product_by_uuid(uuid)?;
        self.product_path(&product)
    }

    pub fn product_path_by_name(&self, product_name: &str) -> Result<PathBuf> {
        let product = self.product_by_name(product_name)?;
        self.product_path(&product)
    }

    fn product_data_paths(
        &self,
        product_path: &Path,
        plugin: &dyn ProductTypePlugin,
    ) -> Result<Vec<PathBuf>> {
        if plugin.use_enclosing_directory() {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(product_path)? {
                paths.push(entry?.path());
            }
            paths.sort();
            Ok(paths)
        } else {
            Ok(vec![product_path.to_path_buf()])
        }
    }

    pub fn retrieve(
        &self,
        where_: &str,
        parameters: &Parameters,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let namespaces = self.namespaces();
        let products = self.search(where_, &[], None, parameters, &namespaces, &[])?;
        products
            .iter()
            .map(|product| self.retrieve_product(product, target_path, use_symlinks))
            .collect()
    }

    pub fn retrieve_by_uuid(
        &self,
        uuid: Uuid,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf> {
        let product = self.product_by_uuid(uuid)?;
        self.retrieve_product(&product, target_path, use_symlinks)
    }

    pub fn retrieve_by_name(
        &self,
        product_name: &str,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf> {
        let product = self.product_by_name(product_name)?;
        self.retrieve_product(&product, target_path, use_symlinks)
    }

    fn retrieve_product(
        &self,
        product: &Properties,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf> {
        // Inactive products are mid-ingest or mid-pull and must not leak.
        if !product.active() || product.archive_path().is_none() {
            return Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )));
        }
        let plugin = self.product_type_plugin(product.product_type()?)?;
        let product_path = self.product_path(product)?;
        self.storage.get(
            &product_path,
            product,
            plugin.as_ref(),
            target_path,
            use_symlinks,
        )
    }

    pub fn export(
        &self,
        where_: &str,
        parameters: &Parameters,
        target_path: &Path,
        format: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let namespaces = self.namespaces();
        let products = self.search(where_, &[], None, parameters, &namespaces, &[])?;
        let mut exported = Vec::with_capacity(products.len());
        for product in &products {
            exported.push(self.export_product(product, target_path, format)?);
        }
        Ok(exported)
    }

    pub fn export_by_uuid(
        &self,
        uuid: Uuid,
        target_path: &Path,
        format: Option<&str>,
    ) -> Result<PathBuf> {
        let product = self.product_by_uuid(uuid)?;
        self.export_product(&product, target_path, format)
    }

    pub fn export_by_name(
        &self,
        product_name: &str,
        target_path: &Path,
        format: Option<&str>,
    ) -> Result<PathBuf> {
        let product = self.product_by_name(product_name)?;
        self.export_product(&product, target_path, format)
    }

    fn export_product(
        &self,
        product: &Properties,
        target_path: &Path,
        format: Option<&str>,
    ) -> Result<PathBuf> {
        if !product.active() {
            return Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )));
        }
        let product_type = product.product_type()?;
        let plugin = self.product_type_plugin(product_type)?;
        match format {
            Some(format) => {
                if !plugin.export_formats().iter().any(|f| f == format) {
                    return Err(Error::User(format!(
                        "export format '{format}' not supported for product type '{product_type}'"
                    )));
                }
                plugin.export(self, product, target_path, Some(format))
            }
            None if plugin.has_custom_export() => {
                plugin.export(self, product, target_path, None)
            }
            None => self.retrieve_product(product, target_path, false),
        }
    }

    // ==================================================================
    // Pull
    // ==================================================================

    /// Pull remote products into the archive. Matching products must be
    /// active, carry `core.remote_url` and have no stored data yet.
    /// Returns the number of products pulled.
    pub fn pull(&mut self, where_: &str, parameters: &Parameters, verify_hash: bool) -> Result<usize> {
        let namespaces = self.namespaces();
        let products = self.search(where_, &[], None, parameters, &namespaces, &[])?;
        let mut count = 0;
        for mut product in products {
            let uuid = product.uuid()?;
            // Only committed catalogue entries may be pulled; anything
            // inactive is still mid-ingest or mid-pull.
            if !product.active() {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }
            if product.archive_path().is_some() {
                return Err(Error::User(format!(
                    "product {} already has data in the archive",
                    product.display_name()
                )));
            }
            let url = product
                .remote_url()
                .ok_or_else(|| {
                    Error::User(format!(
                        "product {} has no remote URL",
                        product.display_name()
                    ))
                })?
                .to_string();

            let plugin = self.product_type_plugin(product.product_type()?)?;
            let remote = self.remote_backend_for_url(&url)?;
            let archive_path = plugin.archive_path(&product)?;

            // Deactivate while the transfer runs; activation commits.
            let mut update = Properties::new();
            update.set_core("active", Value::Boolean(false));
            update.set_core("archive_path", Value::Text(archive_path.clone()));
            self.update_properties(&mut update, Some(uuid), false)?;
            product.set_core("archive_path", Value::Text(archive_path));

            if let Err(err) = self.pull_data(&remote, &product, plugin.as_ref(), verify_hash) {
                let product_path = self.storage.product_path(&product)?;
                if let Err(cleanup) =
                    self.storage.delete(&product_path, &product, plugin.as_ref())
                {
                    warn!(%uuid, error = %cleanup, "failed to clean up pulled data");
                }
                let mut revert = Properties::new();
                revert.set_core("active", Value::Boolean(true));
                revert.set_core("archive_path", Value::Null);
                self.update_properties(&mut revert, Some(uuid), false)?;
                return Err(err);
            }

            let product_path = self.storage.product_path(&product)?;
            let size = util::product_size(&[product_path])?;
            let archive_date = self.backend.server_time_utc()?;
            let mut activation = Properties::new();
            activation.set_core("active", Value::Boolean(true));
            activation.set_core("archive_date", Value::Timestamp(archive_date));
            activation.set_core("size", Value::Integer(size as i64));
            self.update_properties(&mut activation, Some(uuid), false)?;
            product.merge(&activation);

            plugin.post_pull_hook(self, &product)?;
            info!(%uuid, url, "pulled product");
            count += 1;
        }
        Ok(count)
    }

    fn pull_data(
        &mut self,
        remote: &Arc<dyn RemoteBackend>,
        product: &Properties,
        plugin: &dyn ProductTypePlugin,
        verify_hash: bool,
    ) -> Result<()> {
        remote.pull(self, product)?;
        if verify_hash && plugin.use_hash() {
            if let Some(expected) = product.hash() {
                let calculated = self.calculate_hash(product, plugin)?;
                if calculated != expected {
                    return Err(Error::User(format!(
                        "pulled product has incorrect hash: {}",
                        product.display_name()
                    )));
                }
            }
        }
        Ok(())
    }

    // ==================================================================
    // Remove and strip
    // ==================================================================

    /// Remove matching products: stored data and catalogue entry.
    /// Matching an inactive product is an error unless `force` is set.
    /// Returns the number of products removed.
    pub fn remove(&mut self, where_: &str, parameters: &Parameters, force: bool) -> Result<usize> {
        let filter = restrict(where_, &[]);
        let namespaces = self.namespaces();
        let products = self.search(&filter, &[], None, parameters, &namespaces, &[])?;
        for product in &products {
            if !product.active() && !force {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }
            self.purge_product(product)?;
        }
        if !products.is_empty() {
            self.establish_invariants()?;
        }
        Ok(products.len())
    }

    pub fn remove_by_uuid(&mut self, uuid: Uuid, force: bool) -> Result<()> {
        let product = self.product_by_uuid(uuid)?;
        if !product.active() && !force {
            return Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )));
        }
        self.purge_product(&product)?;
        self.establish_invariants()
    }

    pub fn remove_by_name(&mut self, product_name: &str, force: bool) -> Result<()> {
        let uuid = self.product_by_name(product_name)?.uuid()?;
        self.remove_by_uuid(uuid, force)
    }

    fn purge_product(&mut self, product: &Properties) -> Result<()> {
        let uuid = product.uuid()?;
        if product.archive_path().is_some() {
            let plugin = self.product_type_plugin(product.product_type()?)?;
            let product_path = self.storage.product_path(product)?;
            self.storage.delete(&product_path, product, plugin.as_ref())?;
        }
        self.backend.delete_product_properties(uuid)?;
        info!(%uuid, "removed product");
        Ok(())
    }

    /// Remove the stored data of matching products while keeping their
    /// catalogue entries. Matching an inactive product is an error
    /// unless `force` is set. Returns the number of products stripped.
    pub fn strip(&mut self, where_: &str, parameters: &Parameters, force: bool) -> Result<usize> {
        let filter = restrict(where_, &["is_defined(archive_path)"]);
        let namespaces = self.namespaces();
        let products = self.search(&filter, &[], None, parameters, &namespaces, &[])?;
        for product in &products {
            if !product.active() && !force {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }
            self.strip_product(product)?;
        }
        if !products.is_empty() {
            self.establish_invariants()?;
        }
        Ok(products.len())
    }

    pub fn strip_by_uuid(&mut self, uuid: Uuid, force: bool) -> Result<()> {
        let product = self.product_by_uuid(uuid)?;
        if product.archive_path().is_none() {
            return Err(Error::User(format!(
                "product {} has no data in the archive",
                product.display_name()
            )));
        }
        if !product.active() && !force {
            return Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )));
        }
        self.strip_product(&product)?;
        self.establish_invariants()
    }

    pub fn strip_by_name(&mut self, product_name: &str, force: bool) -> Result<()> {
        let uuid = self.product_by_name(product_name)?.uuid()?;
        self.strip_by_uuid(uuid, force)
    }

    fn strip_product(&mut self, product: &Properties) -> Result<()> {
        let uuid = product.uuid()?;
        let plugin = self.product_type_plugin(product.product_type()?)?;
        let product_path = self.storage.product_path(product)?;
        self.storage.delete(&product_path, product, plugin.as_ref())?;
        // A stripped product stays available as a catalogue-only entry,
        // even when it was force-stripped while inactive.
        let mut update = Properties::new();
        update.set_core("active", Value::Boolean(true));
        update.set_core("archive_path", Value::Null);
        update.set_core("archive_date", Value::Null);
        self.update_properties(&mut update, Some(uuid), false)?;
        info!(%uuid, "stripped product");
        Ok(())
    }

    /// Apply the cascade rules of all product types until no rule fires
    /// anymore, bounded by the configured cycle limit.
    fn establish_invariants(&mut self) -> Result<()> {
        let plugins: Vec<(String, CascadeRule)> = self
            .product_type_plugins
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.cascade_rule()))
            .collect();

        let mut cycle = 0;
        loop {
            let mut repeat = false;
            for (product_type, rule) in &plugins {
                if *rule == CascadeRule::Ignore {
                    continue;
                }
                let strip_only = matches!(
                    rule,
                    CascadeRule::Strip | CascadeRule::CascadePurgeAsStrip
                );

                // Grace periods are re-evaluated fresh every cycle.
                let orphans = self.backend.find_products_without_source(
                    product_type,
                    self.cascade_grace_period,
                    strip_only,
                )?;
                for product in &orphans {
                    repeat = true;
                    if strip_only {
                        self.strip_product(product)?;
                    } else {
                        self.purge_product(product)?;
                    }
                }

                if matches!(rule, CascadeRule::Strip | CascadeRule::Cascade) {
                    let unavailable = self
                        .backend
                        .find_products_without_available_source(product_type)?;
                    for product in &unavailable {
                        repeat = true;
                        self.strip_product(product)?;
                    }
                }
            }

            if !repeat {
                return Ok(());
            }
            cycle += 1;
            if cycle >= self.max_cascade_cycles {
                debug!(cycle, "cascade cycle limit reached");
                return Ok(());
            }
        }
    }

    // ==================================================================
    // Maintenance
    // ==================================================================

    /// Re-run the plugin's `analyze` on the stored data and update the
    /// catalogue entry. Lifecycle properties stay under archive control;
    /// `core.size` is refreshed from the data, and the product is moved
    /// when the plugin computes a different archive path.
    pub fn rebuild_properties(&mut self, uuid: Uuid) -> Result<()> {
        let mut product = self.product_by_uuid(uuid)?;
        if !product.active() {
            return Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )));
        }
        let plugin = self.product_type_plugin(product.product_type()?)?;
        let product_path = self.product_path(&product)?;
        let paths = self.product_data_paths(&product_path, plugin.as_ref())?;

        let analysis = plugin.analyze(&paths)?;
        let mut update = analysis.properties;
        for name in CONTROLLED_CORE_PROPERTIES {
            update.remove("core", name);
        }
        update.set_core("size", Value::Integer(util::product_size(&paths)? as i64));
        if let Some(new_archive_path) = self.relocate_product(&product, Some(&update))? {
            update.set_core("archive_path", Value::Text(new_archive_path));
        }
        self.update_properties(&mut update, Some(uuid), true)?;

        if !analysis.tags.is_empty() {
            self.backend.tag(uuid, &analysis.tags)?;
        }
        product.merge(&update);
        plugin.post_ingest_hook(self, &product)?;
        Ok(())
    }

    /// Refresh the size and hash of a previously pulled product,
    /// relocating it when the plugin's archive path changed. With
    /// `verify_hash`, a stored hash that does not match the data is an
    /// error instead of being overwritten.
    pub fn rebuild_pull_properties(&mut self, uuid: Uuid, verify_hash: bool) -> Result<()> {
        let mut product = self.product_by_uuid(uuid)?;
        if product.archive_path().is_none() {
            return Err(Error::User(format!(
                "product {} has no data in the archive",
                product.display_name()
            )));
        }
        if product.remote_url().is_none() {
            return Err(Error::User(format!(
                "product {} has no remote URL",
                product.display_name()
            )));
        }
        let plugin = self.product_type_plugin(product.product_type()?)?;

        let mut update = Properties::new();
        if let Some(new_archive_path) = self.relocate_product(&product, None)? {
            product.set_core("archive_path", Value::Text(new_archive_path.clone()));
            update.set_core("archive_path", Value::Text(new_archive_path));
        }

        let product_path = self.storage.product_path(&product)?;
        update.set_core(
            "size",
            Value::Integer(util::product_size(&[product_path])? as i64),
        );
        if plugin.use_hash() {
            let calculated = self.calculate_hash(&product, plugin.as_ref())?;
            if verify_hash {
                if let Some(expected) = product.hash() {
                    if calculated != expected {
                        return Err(Error::User(format!(
                            "product has incorrect hash: {}",
                            product.display_name()
                        )));
                    }
                }
            }
            update.set_core("hash", Value::Text(calculated));
        }
        self.update_properties(&mut update, Some(uuid), false)?;
        product.merge(&update);
        plugin.post_pull_hook(self, &product)?;
        Ok(())
    }

    /// Move stored products whose plugin-computed archive path changed.
    /// Returns the number of products moved.
    pub fn relocate(&mut self, where_: &str, parameters: &Parameters) -> Result<usize> {
        let filter = restrict(where_, &["is_defined(archive_path)"]);
        let namespaces = self.namespaces();
        let products = self.search(&filter, &[], None, parameters, &namespaces, &[])?;
        let mut count = 0;
        for product in &products {
            if let Some(new_archive_path) = self.relocate_product(product, None)? {
                let mut update = Properties::new();
                update.set_core("archive_path", Value::Text(new_archive_path));
                self.update_properties(&mut update, Some(product.uuid()?), false)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Rename a product's stored data when the plugin computes a
    /// different archive path. `overlay` supplies refreshed properties
    /// that take part in the computation without being persisted here.
    fn relocate_product(
        &mut self,
        product: &Properties,
        overlay: Option<&Properties>,
    ) -> Result<Option<String>> {
        let mut effective = product.clone();
        if let Some(overlay) = overlay {
            effective.merge(overlay);
        }
        let plugin = self.product_type_plugin(effective.product_type()?)?;
        let new_archive_path = plugin.archive_path(&effective)?;
        if product.archive_path() == Some(new_archive_path.as_str()) {
            return Ok(None);
        }
        let product_path = self.storage.product_path(product)?;
        self.storage.rename(&product_path, &new_archive_path)?;
        Ok(Some(new_archive_path))
    }

    /// Verify stored products against their catalogued hash. Returns the
    /// UUIDs of products whose data does not match.
    pub fn verify_hash(&self, where_: &str, parameters: &Parameters) -> Result<Vec<Uuid>> {
        let filter = restrict(where_, &["is_defined(archive_path)"]);
        let namespaces = self.namespaces();
        let products = self.search(&filter, &[], None, parameters, &namespaces, &[])?;
        let mut failed = Vec::new();
        for product in &products {
            let hash = product.hash().ok_or_else(|| {
                Error::User(format!(
                    "no hash available for product {}",
                    product.display_name()
                ))
            })?;
            let plugin = self.product_type_plugin(product.product_type()?)?;
            if self.calculate_hash(product, plugin.as_ref())? != hash {
                failed.push(product.uuid()?);
            }
        }
        Ok(failed)
    }

    /// Hash a stored product from a scratch copy, so hashing also works
    /// for storage backends without locally readable paths. The scratch
    /// directory is cleaned up on every exit path.
    fn calculate_hash(
        &self,
        product: &Properties,
        plugin: &dyn ProductTypePlugin,
    ) -> Result<String> {
        let product_path = self.storage.product_path(product)?;
        let scratch = tempfile::tempdir()?;
        let copy = self.storage.get(
            &product_path,
            product,
            plugin,
            scratch.path(),
            self.storage.supports_symlinks(),
        )?;
        let paths = self.product_data_paths(&copy, plugin)?;
        util::product_hash(&paths)
    }

    // ==================================================================
    // Tags and provenance
    // ==================================================================

    pub fn tag(&mut self, uuid: Uuid, tags: &[String]) -> Result<()> {
        self.backend.tag(uuid, tags)
    }

    pub fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        self.backend.untag(uuid, tags)
    }

    pub fn tags(&self, uuid: Uuid) -> Result<Vec<String>> {
        self.backend.tags(uuid)
    }

    pub fn link(&mut self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()> {
        self.backend.link(uuid, source_uuids)
    }

    pub fn unlink(&mut self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        self.backend.unlink(uuid, source_uuids)
    }

    pub fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.backend.source_products(uuid)
    }

    pub fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.backend.derived_products(uuid)
    }
}

/// Conjoin a user filter with mandatory restrictions.
fn restrict(where_: &str, restrictions: &[&str]) -> String {
    let mut parts: Vec<String> = restrictions.iter().map(|s| s.to_string()).collect();
    if !where_.trim().is_empty() {
        parts.push(format!("({where_})"));
    }
    parts.join(" and ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrict_composes_filters() {
        assert_eq!(restrict("", &[]), "");
        assert_eq!(restrict("size > 1", &[]), "(size > 1)");
        assert_eq!(
            restrict("size > 1", &["active == true"]),
            "active == true and (size > 1)"
        );
        assert_eq!(restrict("", &["active == true"]), "active == true");
    }

    #[test]
    fn namespace_names_are_validated() {
        assert!(NAMESPACE_NAME_RE.is_match("core"));
        assert!(NAMESPACE_NAME_RE.is_match("station.site"));
        assert!(!NAMESPACE_NAME_RE.is_match("Core"));
        assert!(!NAMESPACE_NAME_RE.is_match("core!"));
        assert!(!NAMESPACE_NAME_RE.is_match("2core"));
    }
}
