//! Named resources delivered to the remote side.
//!
//! An [`Asset`] is script, style or binary content with one of three
//! sources: literal bytes, a lazy producer, or a reference to an external
//! resource. Producer and remote sources are resolved on first use and the
//! result is cached for the life of the asset.

use std::{cell::OnceCell, fmt, io};

use bytes::Bytes;
use tether_proto::DefineKind;

use crate::error::AssetError;

/// Content category, derived from the asset name's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// `.js`
    Script,
    /// `.css`
    Style,
    /// Anything else
    Binary,
}

impl AssetKind {
    /// Classify by file extension.
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".js") {
            Self::Script
        } else if name.ends_with(".css") {
            Self::Style
        } else {
            Self::Binary
        }
    }

    /// `DEFINE-<KIND>` used to deliver this kind of asset.
    pub fn define_kind(self) -> DefineKind {
        match self {
            Self::Script => DefineKind::Js,
            Self::Style => DefineKind::Css,
            Self::Binary => DefineKind::Data,
        }
    }
}

/// Lazily evaluated asset body.
pub type Producer = Box<dyn Fn() -> Result<Vec<u8>, String>>;

/// Where an asset's content comes from.
pub enum AssetSource {
    /// Content known up front
    Literal(Bytes),
    /// Computed on first use
    Producer(Producer),
    /// External resource, fetched on first use
    Remote(String),
}

impl fmt::Debug for AssetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(bytes) => f.debug_tuple("Literal").field(&bytes.len()).finish(),
            Self::Producer(_) => f.write_str("Producer"),
            Self::Remote(reference) => f.debug_tuple("Remote").field(reference).finish(),
        }
    }
}

/// Resolves [`AssetSource::Remote`] references.
pub trait ResourceFetcher {
    /// Fetch the bytes behind `reference`.
    fn fetch(&self, reference: &str) -> io::Result<Vec<u8>>;
}

/// Fetcher for stores that have no external resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFetcher;

impl ResourceFetcher for NoFetcher {
    fn fetch(&self, reference: &str) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no fetcher configured for {reference}"),
        ))
    }
}

/// A named resource.
///
/// # Invariants
///
/// - Once resolved the content never changes.
#[derive(Debug)]
pub struct Asset {
    name: String,
    kind: AssetKind,
    source: AssetSource,
    resolved: OnceCell<Bytes>,
}

impl Asset {
    /// Create an asset; the kind is derived from `name`.
    ///
    /// # Errors
    ///
    /// - `AssetError::InvalidName` if `name` is empty or contains characters
    ///   outside `[A-Za-z0-9_.-]`
    pub fn new(name: impl Into<String>, source: AssetSource) -> Result<Self, AssetError> {
        let name = name.into();
        validate_name(&name)?;
        let resolved = OnceCell::new();
        if let AssetSource::Literal(bytes) = &source {
            let _ = resolved.set(bytes.clone());
        }
        Ok(Self { kind: AssetKind::from_name(&name), name, source, resolved })
    }

    /// Built-in literal asset whose name is known to be valid.
    pub(crate) fn builtin(name: &'static str, text: &'static str) -> Self {
        let bytes = Bytes::from_static(text.as_bytes());
        Self {
            name: name.to_string(),
            kind: AssetKind::from_name(name),
            source: AssetSource::Literal(bytes.clone()),
            resolved: OnceCell::from(bytes),
        }
    }

    /// Literal text asset.
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Result<Self, AssetError> {
        Self::new(name, AssetSource::Literal(Bytes::from(text.into())))
    }

    /// Asset name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content category
    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    /// Source description
    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    /// Whether the content has been produced or fetched already.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Content, resolving and caching it on first call.
    ///
    /// # Errors
    ///
    /// - `AssetError::Producer` if the producer fails
    /// - `AssetError::Fetch` if the fetcher fails
    pub fn resolve(&self, fetcher: &dyn ResourceFetcher) -> Result<Bytes, AssetError> {
        if let Some(bytes) = self.resolved.get() {
            return Ok(bytes.clone());
        }

        let bytes = match &self.source {
            AssetSource::Literal(bytes) => bytes.clone(),
            AssetSource::Producer(produce) => Bytes::from(produce().map_err(|reason| {
                AssetError::Producer { name: self.name.clone(), reason }
            })?),
            AssetSource::Remote(reference) => {
                tracing::debug!(asset = %self.name, %reference, "fetching remote asset");
                Bytes::from(fetcher.fetch(reference).map_err(|e| AssetError::Fetch {
                    name: self.name.clone(),
                    reference: reference.clone(),
                    reason: e.to_string(),
                })?)
            },
        };

        Ok(self.resolved.get_or_init(|| bytes).clone())
    }
}

/// Check an asset, module or data name.
pub(crate) fn validate_name(name: &str) -> Result<(), AssetError> {
    if name.is_empty() {
        return Err(AssetError::InvalidName { name: name.to_string(), reason: "empty" });
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(AssetError::InvalidName {
            name: name.to_string(),
            reason: "allowed characters are [A-Za-z0-9_.-]",
        });
    }
    Ok(())
}
