//! Protocol verbs answered from the cache.
//!
//! Single-shot verbs read straight from [`RecordCache`]; list verbs go
//! through the [`SessionManager`] so large results are paged with
//! resumption tokens. Argument problems and missing items surface as
//! [`ProtocolError`]s.

use anyhow::{bail, Result};
use std::io::Write;
use std::sync::Arc;

use crate::cache::RecordCache;
use crate::config::ResponderConfig;
use crate::error::ProtocolError;
use crate::models::CachedFormat;
use crate::provider::{ListProvider, RecordListProvider, RecordQuery, SetListProvider};
use crate::record::parse_datestamp;
use crate::session::ResponsePart;
use crate::session_manager::SessionManager;
use crate::store::CachedContent;

/// Arguments of `ListRecords` and `ListIdentifiers`, as received.
#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    pub metadata_prefix: Option<String>,
    pub set: Option<String>,
    pub from: Option<String>,
    pub until: Option<String>,
    pub resumption_token: Option<String>,
}

pub struct Responder {
    cache: RecordCache,
    sessions: Arc<SessionManager>,
    config: ResponderConfig,
}

impl Responder {
    pub fn new(cache: RecordCache, sessions: Arc<SessionManager>, config: ResponderConfig) -> Self {
        Self {
            cache,
            sessions,
            config,
        }
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    /// Shut down the session manager, removing every part file.
    pub async fn close(&self) {
        self.sessions.close().await;
    }

    pub async fn identify(&self) -> Result<CachedContent> {
        match self.cache.identify().await? {
            Some(content) => Ok(content),
            None => bail!("The repository has not been polled yet"),
        }
    }

    pub async fn get_record(&self, identifier: &str, prefix: &str) -> Result<CachedContent> {
        if !self.cache.item_exists(identifier).await? {
            bail!(ProtocolError::item_does_not_exist());
        }
        match self.cache.record(identifier, prefix).await? {
            Some(content) => Ok(content),
            None => bail!(ProtocolError::bad_format_for_item()),
        }
    }

    pub async fn list_metadata_formats(&self, identifier: Option<&str>) -> Result<Vec<CachedFormat>> {
        if let Some(identifier) = identifier {
            if !self.cache.item_exists(identifier).await? {
                bail!(ProtocolError::item_does_not_exist());
            }
        }
        let formats = self.cache.formats(identifier).await?;
        if formats.is_empty() {
            bail!(ProtocolError::no_formats_for_item());
        }
        Ok(formats)
    }

    pub async fn list_records(&self, args: &ListArgs) -> Result<ResponsePart> {
        self.list_record_headers(args, false).await
    }

    pub async fn list_identifiers(&self, args: &ListArgs) -> Result<ResponsePart> {
        self.list_record_headers(args, true).await
    }

    pub async fn list_sets(&self, resumption_token: Option<&str>) -> Result<ResponsePart> {
        if let Some(token) = resumption_token {
            return self.resume(token, "ListSets").await;
        }
        let provider = SetListProvider::new(self.cache.clone(), self.config.incomplete_set_list_size);
        self.sessions.list(Arc::new(provider)).await
    }

    async fn list_record_headers(&self, args: &ListArgs, headers_only: bool) -> Result<ResponsePart> {
        let verb = if headers_only {
            "ListIdentifiers"
        } else {
            "ListRecords"
        };

        if let Some(token) = &args.resumption_token {
            if args.metadata_prefix.is_some() || args.set.is_some() || args.from.is_some() || args.until.is_some() {
                bail!(ProtocolError::BadArgument(
                    "resumptionToken is an exclusive argument".to_string()
                ));
            }
            return self.resume(token, verb).await;
        }

        let query = parse_query(args)?;
        let provider: Arc<dyn ListProvider> = if headers_only {
            Arc::new(RecordListProvider::identifiers(
                self.cache.clone(),
                query,
                self.config.incomplete_identifier_list_size,
            ))
        } else {
            Arc::new(RecordListProvider::records(
                self.cache.clone(),
                query,
                self.config.incomplete_record_list_size,
            ))
        };
        self.sessions.list(provider).await
    }

    async fn resume(&self, token: &str, verb: &str) -> Result<ResponsePart> {
        self.sessions.resolve(token, verb).await
    }
}

fn parse_query(args: &ListArgs) -> Result<RecordQuery> {
    let Some(prefix) = &args.metadata_prefix else {
        bail!(ProtocolError::BadArgument("metadataPrefix is required".to_string()));
    };

    let parse = |name: &str, value: &Option<String>| match value {
        None => Ok(None),
        Some(v) => parse_datestamp(v)
            .map(Some)
            .map_err(|_| ProtocolError::BadArgument(format!("bad {name} date: {v}"))),
    };
    let from = parse("from", &args.from)?;
    let until = parse("until", &args.until)?;

    if let (Some(from), Some(until)) = (from, until) {
        if from > until {
            bail!(ProtocolError::BadArgument(
                "the from date must not be later than the until date".to_string()
            ));
        }
    }

    Ok(RecordQuery {
        prefix: prefix.clone(),
        set: args.set.clone(),
        from,
        until,
    })
}

/// Render a `ListMetadataFormats` response.
pub fn write_formats(formats: &[CachedFormat], out: &mut dyn Write) -> Result<()> {
    use quick_xml::escape::escape;

    writeln!(out, "<ListMetadataFormats>")?;
    for format in formats {
        writeln!(out, "  <metadataFormat>")?;
        writeln!(out, "    <metadataPrefix>{}</metadataPrefix>", escape(format.prefix.as_str()))?;
        writeln!(out, "    <schema>{}</schema>", escape(format.schema_location.as_str()))?;
        writeln!(
            out,
            "    <metadataNamespace>{}</metadataNamespace>",
            escape(format.namespace_uri.as_str())
        )?;
        writeln!(out, "  </metadataFormat>")?;
    }
    writeln!(out, "</ListMetadataFormats>")?;
    Ok(())
}
