// Namespace and identifier derivation for a pipeline
// Every artifact a pipeline owns lives in a schema derived from its name


use crate::config::PipelineConfig;

const NAMESPACE_PREFIX: &str = "ragmatic_";

const DEFAULT_SHADOW_TABLE: &str = "shadows";
const DEFAULT_CHUNKS_TABLE: &str = "chunks";
const DEFAULT_WORK_QUEUE_TABLE: &str = "work_queue";
const DEFAULT_CONFIG_TABLE: &str = "config";

/// Replace every non-alphanumeric character with an underscore.
#[inline]
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Double-quote an identifier for embedding into SQL.
#[inline]
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// All identifiers a pipeline derives from its name and source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNames {
    schema: String,
    source_schema: String,
    source_table: String,
    shadow_table: String,
    chunks_table: String,
    work_queue_table: String,
    config_table: String,
}

impl PipelineNames {
    #[inline]
    pub fn new(config: &PipelineConfig) -> Self {
        let (source_schema, source_table) = match config.source_table.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => ("public".to_string(), config.source_table.clone()),
        };

        Self {
            schema: format!("{NAMESPACE_PREFIX}{}", sanitize_identifier(&config.name)),
            source_schema,
            source_table,
            shadow_table: config
                .shadow_table
                .clone()
                .unwrap_or_else(|| DEFAULT_SHADOW_TABLE.to_string()),
            chunks_table: config
                .chunks_table
                .clone()
                .unwrap_or_else(|| DEFAULT_CHUNKS_TABLE.to_string()),
            work_queue_table: DEFAULT_WORK_QUEUE_TABLE.to_string(),
            config_table: DEFAULT_CONFIG_TABLE.to_string(),
        }
    }

    /// Unquoted schema name, e.g. `ragmatic_articles`.
    #[inline]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[inline]
    pub fn source_schema(&self) -> &str {
        &self.source_schema
    }

    #[inline]
    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    /// Quoted, schema-qualified source table.
    #[inline]
    pub fn source(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.source_schema),
            quote_identifier(&self.source_table)
        )
    }

    #[inline]
    pub fn shadow_table(&self) -> &str {
        &self.shadow_table
    }

    #[inline]
    pub fn chunks_table(&self) -> &str {
        &self.chunks_table
    }

    #[inline]
    pub fn shadow(&self) -> String {
        self.qualified(&self.shadow_table)
    }

    #[inline]
    pub fn chunks(&self) -> String {
        self.qualified(&self.chunks_table)
    }

    #[inline]
    pub fn work_queue(&self) -> String {
        self.qualified(&self.work_queue_table)
    }

    #[inline]
    pub fn config(&self) -> String {
        self.qualified(&self.config_table)
    }

    /// Unquoted name of the trigger attached to the source table.
    #[inline]
    pub fn trigger(&self) -> String {
        format!("{}_shadow_sync", self.schema)
    }

    /// Quoted, schema-qualified trigger function.
    #[inline]
    pub fn trigger_function(&self) -> String {
        self.qualified("shadow_sync")
    }

    /// Unquoted name of the DDL event trigger (event trigger names are global).
    #[inline]
    pub fn event_trigger(&self) -> String {
        format!("{}_source_drop", self.schema)
    }

    /// Quoted, schema-qualified cleanup function run by the event trigger.
    #[inline]
    pub fn event_trigger_function(&self) -> String {
        self.qualified("source_drop_cleanup")
    }

    fn qualified(&self, table: &str) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(table)
        )
    }
}
