//! Per-request state: URI dissection, session binding, and the
//! translate loop bookkeeping.

use bytes::Bytes;
use ferry_core::uri::DissectedUri;
use ferry_http::server::ServerRequest;
use ferry_session::{SessionId, SessionManager, parse_cookie_header, session_cookie_name};
use ferry_translation::{Transformation, TranslateRequest, TranslateResponse};
use http_crate::{HeaderMap, Method};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use ::http as http_crate;

pub const MAX_CHECKS: u32 = 4;
pub const MAX_INTERNAL_REDIRECTS: u32 = 4;
pub const MAX_READ_FILE: u32 = 4;
pub const MAX_FILE_NOT_FOUND: u32 = 8;
pub const MAX_DIRECTORY_INDEX: u32 = 8;
pub const MAX_PROBE_PATH_SUFFIXES: u32 = 8;

/// Identify well-known bots and crawlers.
pub fn user_agent_is_bot(user_agent: &str) -> bool {
    user_agent.contains("bot.html") /* Google and MSN */
        || user_agent.contains("ysearch") /* Yahoo */
}

pub struct RequestContext {
    pub method: Method,
    pub raw_uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub http_1_0: bool,
    pub is_upgrade: bool,

    pub uri: DissectedUri,

    /// Bots and UA-less clients never get a session.
    pub stateless: bool,
    pub session_cookie: String,
    pub session_id: Option<SessionId>,
    /// The realm recorded in the resumed session, for spoof checks.
    pub session_realm: Option<String>,
    pub send_session_cookie: bool,
    pub realm: Option<String>,

    pub translate_request: TranslateRequest,
    pub translate_response: Option<Rc<TranslateResponse>>,
    /// Remaining transformation chain of the selected view.
    pub transformations: VecDeque<Transformation>,
    pub transformed: bool,
    pub resource_tag: Option<String>,

    pub n_checks: u32,
    pub n_internal_redirects: u32,
    pub n_read_file: u32,
    pub n_file_not_found: u32,
    pub n_directory_index: u32,
    pub n_probe_path_suffixes: u32,
}

impl RequestContext {
    pub fn new(
        request: ServerRequest,
        cookie_template: &str,
        dynamic_session_cookie: bool,
    ) -> Self {
        let uri = DissectedUri::parse(&request.uri);
        let host = request.header("host");
        let session_cookie =
            session_cookie_name(cookie_template, dynamic_session_cookie, host);

        RequestContext {
            method: request.method,
            raw_uri: request.uri,
            headers: request.headers,
            body: request.body,
            peer_addr: request.peer_addr,
            local_addr: request.local_addr,
            http_1_0: request.http_1_0,
            is_upgrade: request.upgrade,
            uri,
            stateless: false,
            session_cookie,
            session_id: None,
            session_realm: None,
            send_session_cookie: false,
            realm: None,
            translate_request: TranslateRequest::default(),
            translate_response: None,
            transformations: VecDeque::new(),
            transformed: false,
            resource_tag: None,
            n_checks: 0,
            n_internal_redirects: 0,
            n_read_file: 0,
            n_file_not_found: 0,
            n_directory_index: 0,
            n_probe_path_suffixes: 0,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether any transformation remains to be applied.
    pub fn transformation_enabled(&self) -> bool {
        !self.transformations.is_empty()
    }

    pub fn pop_transformation(&mut self) -> Option<Transformation> {
        self.transformations.pop_front()
    }

    /// The session id from the URI args or from the session cookie.
    pub fn determine_session(&mut self, sessions: &SessionManager) {
        self.session_realm = None;

        let user_agent = self.header("user-agent");
        self.stateless = match user_agent {
            None => true,
            Some(ua) => user_agent_is_bot(ua),
        };
        if self.stateless {
            // don't propagate a stale session id to processed URIs
            self.uri.args.remove("session");
            return;
        }

        let uri_sid = self.uri.args.get("session").cloned().filter(|s| !s.is_empty());
        let mut cookie_received = false;
        let sid = match uri_sid {
            Some(sid) => sid,
            None => {
                let Some(sid) = self.cookie_session_id() else {
                    return;
                };
                cookie_received = true;
                sid
            }
        };

        let Some(id) = SessionId::parse(&sid) else {
            if !cookie_received {
                self.uri.args.remove("session");
            }
            return;
        };

        let loaded = sessions.with_session(id, |session| {
            session.is_new = false;
            (
                session.realm.clone(),
                session.translate.clone(),
                session.cookie_sent,
            )
        });

        let Some((realm, translate, cookie_sent)) = loaded else {
            if !cookie_received {
                // remove the stale session id from the URI args
                self.uri.args.remove("session");
            }
            return;
        };

        self.session_id = Some(id);
        if let Some(blob) = translate {
            self.translate_request.session = Some(blob);
        }
        if !cookie_sent {
            self.send_session_cookie = true;
        }

        if !cookie_received {
            if let Some(cookie_sid) = self.cookie_session_id() {
                if cookie_sid == sid {
                    cookie_received = true;
                }
            }
        }

        if cookie_received {
            sessions.with_session(id, |session| session.cookie_received = true);
            // we're using cookies; the URI copy is redundant
            self.uri.args.remove("session");
        }

        self.session_realm = Some(realm);
    }

    fn cookie_session_id(&self) -> Option<String> {
        let header = self.header("cookie")?;
        parse_cookie_header(header)
            .remove(&self.session_cookie)
            .filter(|s| !s.is_empty())
    }

    /// The session for this request, creating one if missing.
    pub fn make_session(&mut self, sessions: &SessionManager) -> Option<SessionId> {
        if self.stateless {
            return None;
        }
        if let Some(id) = self.session_id {
            if sessions.exists(id) {
                return Some(id);
            }
        }

        let realm = self.realm.clone().unwrap_or_default();
        let id = sessions.create(&realm);
        self.session_id = Some(id);
        self.send_session_cookie = true;
        self.uri.args.insert("session".to_string(), id.to_string());
        Some(id)
    }

    /// Forget the session for this request without deleting it.
    pub fn ignore_session(&mut self) {
        if self.session_id.is_none() {
            return;
        }
        self.uri.args.remove("session");
        self.session_id = None;
        self.send_session_cookie = false;
    }

    /// Delete the session.
    pub fn discard_session(&mut self, sessions: &SessionManager) {
        let Some(id) = self.session_id else { return };
        self.uri.args.remove("session");
        sessions.delete(id);
        self.session_id = None;
        self.send_session_cookie = false;
    }

    /// Derive the realm, considering the translation override, and
    /// drop a session that was issued for another realm.
    pub fn apply_translate_realm(&mut self, response: &TranslateResponse) {
        if self.realm.is_some() {
            return;
        }

        let realm = if let Some(realm) = &response.realm {
            realm.clone()
        } else if response.realm_from_auth_base {
            response
                .auth
                .as_ref()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .unwrap_or_default()
        } else if let Some(host) = self.header("host") {
            host.to_ascii_lowercase()
        } else {
            String::new()
        };

        if let Some(session_realm) = &self.session_realm {
            if *session_realm != realm {
                tracing::info!(
                    session_realm = %session_realm,
                    request_realm = %realm,
                    uri = %self.raw_uri,
                    "ignoring spoofed session id from another realm"
                );
                self.ignore_session();
            }
        }

        self.realm = Some(realm);
    }

    /// Apply SESSION / USER / LANGUAGE / SESSION_SITE side effects.
    pub fn apply_translate_session(
        &mut self,
        sessions: &SessionManager,
        response: &TranslateResponse,
    ) {
        if response.session.is_none()
            && response.user.is_none()
            && response.session_site.is_none()
            && response.language.is_none()
        {
            return;
        }

        if let Some(blob) = &response.session {
            if blob.is_empty() {
                if let Some(id) = self.session_id {
                    sessions.with_session(id, |s| s.translate = None);
                }
            } else if let Some(id) = self.make_session(sessions) {
                let blob = blob.clone();
                sessions.with_session(id, move |s| s.translate = Some(blob));
            }
        }

        if let Some(site) = &response.session_site {
            if site.is_empty() {
                if let Some(id) = self.session_id {
                    sessions.with_session(id, |s| s.site = None);
                }
            } else if let Some(id) = self.make_session(sessions) {
                let site = site.clone();
                sessions.with_session(id, move |s| s.site = Some(site));
            }
        }

        match &response.user {
            Some(user) if user.is_empty() => {
                // log out
                if let Some(id) = self.session_id {
                    sessions.with_session(id, |s| s.clear_user());
                }
            }
            Some(user) => {
                if let Some(id) = self.make_session(sessions) {
                    let user = user.clone();
                    let max_age = response.user_max_age;
                    sessions.with_session(id, move |s| s.set_user(&user, max_age));
                }
            }
            None => {
                // expire a stale login
                if let Some(id) = self.session_id {
                    sessions.with_session(id, |s| {
                        let _ = s.valid_user();
                    });
                }
            }
        }

        if let Some(language) = &response.language {
            if language.is_empty() {
                if let Some(id) = self.session_id {
                    sessions.with_session(id, |s| s.language = None);
                }
            } else if let Some(id) = self.make_session(sessions) {
                let language = language.clone();
                sessions.with_session(id, move |s| s.language = Some(language));
            }
        }
    }

    /// The absolute external URI of this request.
    pub fn absolute_uri(&self) -> String {
        let scheme = "http";
        let host = self.header("host").unwrap_or("localhost");
        format!("{}://{}{}", scheme, host, self.raw_uri)
    }
}
