//! Cache for translation server responses.
//!
//! Entries are keyed by the request URI (with error-document status
//! and CHECK/AUTH token suffixes mixed in) and matched against the
//! response's `vary[]` dimensions.  A response carrying BASE is stored
//! with its address rewritten to the base parent, so one entry serves
//! every child URI by suffix substitution.

use crate::protocol::Command;
use crate::request::TranslateRequest;
use crate::response::TranslateResponse;
use bytes::Bytes;
use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Request values captured at store time for the entry's `vary[]`
/// dimensions.  Absent dimensions stay `None`.
#[derive(Debug, Default, Clone)]
struct VaryValues {
    session: Option<Bytes>,
    local_address: Option<String>,
    remote_host: Option<String>,
    host: Option<String>,
    language: Option<String>,
    user_agent: Option<String>,
    query_string: Option<String>,
    listener_tag: Option<String>,
}

struct CacheEntry {
    key: String,
    vary: VaryValues,
    response: TranslateResponse,
    regex: Option<Regex>,
    inverse_regex: Option<Regex>,
    expires: Instant,
}

fn compile(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "failed to compile translation regex");
            None
        }
    }
}

/// The suffix of `uri` relative to `base`, when `base` ends with '/'
/// and `uri` lies strictly below it.
fn base_suffix<'a>(uri: Option<&'a str>, base: Option<&str>) -> Option<&'a str> {
    let uri = uri?;
    let base = base?;
    if base.is_empty() || !base.ends_with('/') || uri.len() <= base.len() {
        return None;
    }
    uri.strip_prefix(base)
}

fn string_match(a: Option<&str>, b: Option<&str>, strict: bool) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => !strict,
        _ => false,
    }
}

fn bytes_match(a: Option<&Bytes>, b: Option<&Bytes>, strict: bool) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => !strict,
        _ => false,
    }
}

/// Compare the entry's stored key with a request URI, stripping the
/// `ERR<status>_` prefix and the `|CHECK=`/`|AUTH=` suffixes.
fn uri_match(key: &str, uri: Option<&str>, strict: bool) -> bool {
    let Some(uri) = uri else {
        return !strict;
    };
    let mut key = key;
    if let Some(rest) = key.strip_prefix("ERR") {
        if let Some(underscore) = rest.find('_') {
            if rest[..underscore].chars().all(|c| c.is_ascii_digit()) {
                key = &rest[underscore + 1..];
            }
        }
    }
    let key = match key.find("|CHECK=").or_else(|| key.find("|AUTH=")) {
        Some(i) => &key[..i],
        None => key,
    };
    key == uri
}

pub struct TranslationCache {
    /// key → variants (one per distinct vary combination)
    entries: HashMap<String, Vec<Rc<CacheEntry>>>,
    /// site → keys carrying that site, for O(#site-entries) purge
    site_index: HashMap<String, HashSet<String>>,
    /// insertion order for capacity eviction
    order: VecDeque<String>,
    capacity: usize,
    len: usize,
}

impl TranslationCache {
    pub fn new(capacity: usize) -> Self {
        TranslationCache {
            entries: HashMap::new(),
            site_index: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The cache key for a request, or `None` when the request cannot
    /// produce a cacheable response.
    pub fn request_key(request: &TranslateRequest) -> Option<String> {
        if !request.is_cacheable() {
            return None;
        }
        let mut key = match (&request.uri, &request.widget_type) {
            (Some(uri), _) => {
                if request.error_document_status != 0 {
                    format!("ERR{}_{}", request.error_document_status, uri)
                } else {
                    uri.clone()
                }
            }
            (None, Some(widget_type)) => widget_type.clone(),
            (None, None) => return None,
        };
        if let Some(check) = &request.check {
            key.push_str("|CHECK=");
            key.push_str(&String::from_utf8_lossy(check));
        }
        if let Some(auth) = &request.auth {
            key.push_str("|AUTH=");
            key.push_str(&String::from_utf8_lossy(auth));
        }
        Some(key)
    }

    fn vary_match(
        entry: &CacheEntry,
        request: &TranslateRequest,
        command: u16,
        strict: bool,
    ) -> bool {
        match Command::from_u16(command) {
            Some(Command::Uri) => uri_match(&entry.key, request.uri.as_deref(), strict),
            Some(Command::Session) => {
                bytes_match(entry.vary.session.as_ref(), request.session.as_ref(), strict)
            }
            Some(Command::LocalAddress) | Some(Command::LocalAddressString) => string_match(
                entry.vary.local_address.as_deref(),
                request.local_address.as_deref(),
                strict,
            ),
            Some(Command::RemoteHost) => string_match(
                entry.vary.remote_host.as_deref(),
                request.remote_host.as_deref(),
                strict,
            ),
            Some(Command::Host) => {
                string_match(entry.vary.host.as_deref(), request.host.as_deref(), strict)
            }
            Some(Command::Language) => string_match(
                entry.vary.language.as_deref(),
                request.accept_language.as_deref(),
                strict,
            ),
            Some(Command::UserAgent) => string_match(
                entry.vary.user_agent.as_deref(),
                request.user_agent.as_deref(),
                strict,
            ),
            Some(Command::QueryString) => string_match(
                entry.vary.query_string.as_deref(),
                request.query_string.as_deref(),
                strict,
            ),
            Some(Command::ListenerTag) => string_match(
                entry.vary.listener_tag.as_deref(),
                request.listener_tag.as_deref(),
                strict,
            ),
            _ => !strict,
        }
    }

    fn entry_matches(
        entry: &CacheEntry,
        request: &TranslateRequest,
        find_base: bool,
        now: Instant,
    ) -> bool {
        if entry.expires <= now {
            return false;
        }
        if find_base && entry.response.base.is_none() {
            return false;
        }
        if entry.response.base.is_some() {
            if let Some(re) = &entry.inverse_regex {
                if let Some(uri) = &request.uri {
                    if re.is_match(uri) {
                        return false;
                    }
                }
            }
            if let Some(re) = &entry.regex {
                match &request.uri {
                    Some(uri) if re.is_match(uri) => {}
                    _ => return false,
                }
            }
        }
        entry
            .response
            .vary
            .iter()
            .all(|&dim| Self::vary_match(entry, request, dim, false))
    }

    fn get(
        &self,
        key: &str,
        request: &TranslateRequest,
        find_base: bool,
        now: Instant,
    ) -> Option<Rc<CacheEntry>> {
        self.entries.get(key).and_then(|variants| {
            variants
                .iter()
                .find(|e| Self::entry_matches(e, request, find_base, now))
                .cloned()
        })
    }

    /// Look up a response for the request.  A miss returns `None`; a
    /// hit returns the reconstructed response (BASE suffix applied).
    pub fn lookup(&mut self, request: &TranslateRequest) -> Option<TranslateResponse> {
        let key = Self::request_key(request)?;
        let now = Instant::now();

        let mut item = self.get(&key, request, false, now);

        if item.is_none() && request.uri.is_some() {
            // walk up the URI looking for BASE entries
            let mut uri = key.clone();
            if uri.ends_with('/') {
                uri.pop();
            }
            while let Some(slash) = uri.rfind('/') {
                uri.truncate(slash + 1);
                item = self.get(&uri, request, true, now);
                if item.is_some() {
                    break;
                }
                uri.pop();
            }
        }

        let item = item?;
        Some(Self::load_response(&item, &key))
    }

    /// Reconstruct the concrete response from a stored entry.
    fn load_response(entry: &CacheEntry, request_key: &str) -> TranslateResponse {
        let mut response = entry.response.clone();
        if let Some(base) = &response.base {
            if let Some(suffix) = request_key.strip_prefix(base.as_str()) {
                if let Some(address) = entry.response.address.load_base(suffix) {
                    response.address = address;
                }
            }
        }
        response
    }

    /// Store a response.  No-op when the response is not cacheable.
    pub fn store(&mut self, request: &TranslateRequest, response: &TranslateResponse) {
        if !response.is_cacheable() {
            return;
        }
        let Some(request_key) = Self::request_key(request) else {
            return;
        };

        let mut stored = response.clone();
        // per-session fields must not be shared across requests
        stored.session = None;
        stored.user = None;
        stored.user_max_age = None;
        stored.language = None;

        // BASE rewrite: store the suffix-stripped parent address under
        // the truncated key
        let mut key = request_key.clone();
        let suffix = base_suffix(request.uri.as_deref(), response.base.as_deref())
            .map(str::to_string);
        match suffix
            .as_deref()
            .and_then(|s| response.address.save_base(s))
        {
            Some(parent) => {
                let suffix = suffix.unwrap();
                stored.address = parent;
                let uri = request.uri.as_deref().unwrap();
                let base_uri = &uri[..uri.len() - suffix.len()];
                key = if request.error_document_status != 0 {
                    format!("ERR{}_{}", request.error_document_status, base_uri)
                } else {
                    base_uri.to_string()
                };
                if let Some(check) = &request.check {
                    key.push_str("|CHECK=");
                    key.push_str(&String::from_utf8_lossy(check));
                }
                if let Some(auth) = &request.auth {
                    key.push_str("|AUTH=");
                    key.push_str(&String::from_utf8_lossy(auth));
                }
                // the response-level uri is truncated the same way
                if let Some(resp_uri) = &stored.uri {
                    stored.uri = resp_uri
                        .strip_suffix(suffix.as_str())
                        .filter(|p| p.ends_with('/'))
                        .map(str::to_string);
                }
            }
            None => {
                // BASE did not match the request URI
                stored.base = None;
            }
        }

        let vary = VaryValues {
            session: if stored.vary_contains(Command::Session) {
                request.session.clone()
            } else {
                None
            },
            local_address: if stored.vary_contains(Command::LocalAddress)
                || stored.vary_contains(Command::LocalAddressString)
            {
                request.local_address.clone()
            } else {
                None
            },
            remote_host: if stored.vary_contains(Command::RemoteHost) {
                request.remote_host.clone()
            } else {
                None
            },
            host: if stored.vary_contains(Command::Host) {
                request.host.clone()
            } else {
                None
            },
            language: if stored.vary_contains(Command::Language) {
                request.accept_language.clone()
            } else {
                None
            },
            user_agent: if stored.vary_contains(Command::UserAgent) {
                request.user_agent.clone()
            } else {
                None
            },
            query_string: if stored.vary_contains(Command::QueryString) {
                request.query_string.clone()
            } else {
                None
            },
            listener_tag: if stored.vary_contains(Command::ListenerTag) {
                request.listener_tag.clone()
            } else {
                None
            },
        };

        let regex = stored.regex.as_deref().and_then(compile);
        let inverse_regex = stored.inverse_regex.as_deref().and_then(compile);
        let ttl = Duration::from_secs(stored.effective_max_age() as u64);
        let site = stored.site.clone();

        let entry = Rc::new(CacheEntry {
            key: key.clone(),
            vary,
            response: stored,
            regex,
            inverse_regex,
            expires: Instant::now() + ttl,
        });

        // replace any variant this request also matches; expired
        // variants go too
        let now = Instant::now();
        let variants = self.entries.entry(key.clone()).or_default();
        let before = variants.len();
        variants.retain(|e| e.expires > now && !Self::entry_matches(e, request, false, now));
        self.len -= before - variants.len();
        variants.push(entry);
        self.len += 1;
        self.order.push_back(key.clone());

        if let Some(site) = site {
            self.site_index.entry(site).or_default().insert(key);
        }

        self.evict();
    }

    fn evict(&mut self) {
        while self.len > self.capacity {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(variants) = self.entries.get_mut(&key) {
                if !variants.is_empty() {
                    variants.remove(0);
                    self.len -= 1;
                }
                if variants.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Apply the `invalidate[]` dimensions of a response: drop every
    /// entry whose stored values for those dimensions strictly match
    /// the current request's values.
    pub fn invalidate(
        &mut self,
        request: &TranslateRequest,
        dimensions: &[u16],
        site: Option<&str>,
    ) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, variants| {
            let before = variants.len();
            variants.retain(|e| {
                if let Some(site) = site {
                    if e.response.site.as_deref() != Some(site) {
                        return true;
                    }
                }
                let matches = dimensions
                    .iter()
                    .all(|&dim| Self::vary_match(e, request, dim, true));
                !matches
            });
            removed += before - variants.len();
            !variants.is_empty()
        });
        self.len -= removed;
        if removed > 0 {
            tracing::debug!(removed, "translation cache invalidated");
        }
        removed
    }

    /// Remove every entry belonging to a site.
    pub fn invalidate_site(&mut self, site: &str) -> usize {
        let Some(keys) = self.site_index.remove(site) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if let Some(variants) = self.entries.get_mut(&key) {
                let before = variants.len();
                variants.retain(|e| e.response.site.as_deref() != Some(site));
                removed += before - variants.len();
                if variants.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
        self.len -= removed;
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.site_index.clear();
        self.order.clear();
        self.len = 0;
    }
}
