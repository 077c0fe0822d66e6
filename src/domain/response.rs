//! The fused response entity and the holdings filter.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// An opaque metadata document. The blob store's bytes are carried as-is
/// and spliced verbatim into the encoded response; the service only parses
/// them inside the holdings filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlob(Bytes);

impl RawBlob {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<'de> Deserialize<'de> for RawBlob {
    // Only exercised on the cache path, where the surrounding document is
    // one of our own encodings.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: Box<RawValue> = Deserialize::deserialize(deserializer)?;
        Ok(Self(Bytes::copy_from_slice(raw.get().as_bytes())))
    }
}

/// Minimal projection of a metadata blob, just enough for the holdings
/// filter. Every other blob field is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct Snippet {
    #[serde(default)]
    pub institution: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FilterError {
    /// A stored blob failed to parse; the underlying index data is broken.
    #[error("internal data broken: {0}")]
    InvalidBlob(#[from] serde_json::Error),
}

/// A subset of index data fused with citation data. Citing and cited
/// documents are raw bytes, but typically will contain JSON. For unmatched
/// documents only the DOI is carried, e.g. `{"doi_str_mv": "10.12/34"}`.
#[derive(Debug, Default, Deserialize)]
pub struct FusedResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub doi: String,
    #[serde(default)]
    pub citing: Vec<RawBlob>,
    #[serde(default)]
    pub cited: Vec<RawBlob>,
    #[serde(default)]
    pub unmatched: Unmatched,
    #[serde(default)]
    pub extra: Extra,
}

#[derive(Debug, Default, Deserialize)]
pub struct Unmatched {
    #[serde(default)]
    pub citing: Vec<RawBlob>,
    #[serde(default)]
    pub cited: Vec<RawBlob>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Extra {
    #[serde(default)]
    pub unmatched_citing_count: usize,
    #[serde(default)]
    pub unmatched_cited_count: usize,
    #[serde(default)]
    pub citing_count: usize,
    #[serde(default)]
    pub cited_count: usize,
    #[serde(default)]
    pub cached: bool,
    /// Wall time in seconds from request receipt to response emission.
    #[serde(default)]
    pub took: f64,
    /// Set when the response has been tailored to the holdings of an
    /// institution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
}

impl FusedResponse {
    /// Recomputes the count fields from the arrays. Call after any array
    /// mutation; the counts are a pure function of the arrays.
    pub fn update_counts(&mut self) {
        self.extra.citing_count = self.citing.len();
        self.extra.cited_count = self.cited.len();
        self.extra.unmatched_citing_count = self.unmatched.citing.len();
        self.extra.unmatched_cited_count = self.unmatched.cited.len();
    }

    /// Rearranges citing and cited documents in place based on the holdings
    /// of an institution, given by its ISIL (ISO 15511). Documents whose
    /// `institution` array does not contain the tag move to the unmatched
    /// buckets. This is the one place blob contents are parsed; a blob that
    /// does not parse fails the whole request.
    pub fn apply_institution_filter(&mut self, isil: &str) -> Result<(), FilterError> {
        let mut citing = Vec::with_capacity(self.citing.len());
        for blob in std::mem::take(&mut self.citing) {
            if holds(&blob, isil)? {
                citing.push(blob);
            } else {
                self.unmatched.citing.push(blob);
            }
        }
        self.citing = citing;

        let mut cited = Vec::with_capacity(self.cited.len());
        for blob in std::mem::take(&mut self.cited) {
            if holds(&blob, isil)? {
                cited.push(blob);
            } else {
                self.unmatched.cited.push(blob);
            }
        }
        self.cited = cited;

        self.update_counts();
        self.extra.institution = Some(isil.to_string());
        Ok(())
    }

    /// Encodes the response body. The envelope is regular JSON encoding;
    /// blob payloads are spliced in verbatim, exactly the bytes the blob
    /// store returned. Empty `id`, `doi` and arrays are omitted;
    /// `unmatched` and `extra` are always present.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(256);
        let mut first = true;
        out.push(b'{');
        if !self.id.is_empty() {
            push_key(&mut out, &mut first, "id");
            out.append(&mut serde_json::to_vec(&self.id)?);
        }
        if !self.doi.is_empty() {
            push_key(&mut out, &mut first, "doi");
            out.append(&mut serde_json::to_vec(&self.doi)?);
        }
        if !self.citing.is_empty() {
            push_key(&mut out, &mut first, "citing");
            push_blobs(&mut out, &self.citing);
        }
        if !self.cited.is_empty() {
            push_key(&mut out, &mut first, "cited");
            push_blobs(&mut out, &self.cited);
        }
        push_key(&mut out, &mut first, "unmatched");
        out.push(b'{');
        let mut inner = true;
        if !self.unmatched.citing.is_empty() {
            push_key(&mut out, &mut inner, "citing");
            push_blobs(&mut out, &self.unmatched.citing);
        }
        if !self.unmatched.cited.is_empty() {
            push_key(&mut out, &mut inner, "cited");
            push_blobs(&mut out, &self.unmatched.cited);
        }
        out.push(b'}');
        push_key(&mut out, &mut first, "extra");
        out.append(&mut serde_json::to_vec(&self.extra)?);
        out.push(b'}');
        Ok(out)
    }
}

fn push_key(out: &mut Vec<u8>, first: &mut bool, key: &str) {
    if *first {
        *first = false;
    } else {
        out.push(b',');
    }
    out.push(b'"');
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b"\":");
}

fn push_blobs(out: &mut Vec<u8>, blobs: &[RawBlob]) {
    out.push(b'[');
    for (index, blob) in blobs.iter().enumerate() {
        if index > 0 {
            out.push(b',');
        }
        out.extend_from_slice(blob.as_bytes());
    }
    out.push(b']');
}

fn holds(blob: &RawBlob, isil: &str) -> Result<bool, FilterError> {
    let snippet: Snippet = serde_json::from_slice(blob.as_bytes())?;
    Ok(snippet.institution.iter().any(|tag| tag == isil))
}
