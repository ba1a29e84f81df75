use ferry_core::ResourceAddress;
use ferry_core::address::{CgiAddress, FileAddress, HttpAddress};
use ferry_core::relocate::relocate_uri;
use ferry_core::uri::DissectedUri;

// ── BASE save/load across address types ─────────────────────────

#[test]
fn base_round_trip_preserves_paths() {
    let cases = [
        ("/var/www/site/a/b.html", "a/b.html", "c/d.html", "/var/www/site/c/d.html"),
        ("/srv/files/readme.txt", "readme.txt", "other.txt", "/srv/files/other.txt"),
    ];
    for (path, save_suffix, load_suffix, expected) in cases {
        let addr = ResourceAddress::Local(FileAddress::new(path));
        let base = addr.save_base(save_suffix).unwrap();
        let child = base.load_base(load_suffix).unwrap();
        match child {
            ResourceAddress::Local(a) => assert_eq!(a.path, expected),
            other => panic!("expected Local, got {:?}", other),
        }
    }
}

#[test]
fn base_identity_round_trip() {
    // LoadBase(SaveBase(s)) with the same suffix reconstructs the
    // original address exactly
    let original = ResourceAddress::Local(FileAddress::new("/srv/www/app/index.html"));
    let base = original.save_base("app/index.html").unwrap();
    let restored = base.load_base("app/index.html").unwrap();
    assert_eq!(restored, original);
}

#[test]
fn save_base_with_non_matching_suffix_is_none() {
    let addr = ResourceAddress::Local(FileAddress::new("/srv/www/app/index.html"));
    assert!(addr.save_base("nomatch.html").is_none());

    let mut cgi = CgiAddress::new("/usr/bin/app");
    cgi.path_info = Some("/a/b".into());
    let addr = ResourceAddress::Fastcgi(cgi);
    assert!(addr.save_base("x/y").is_none());
}

#[test]
fn http_base_preserves_host() {
    let addr = ResourceAddress::Http(HttpAddress::parse("http://app:8080/site/x.html").unwrap());
    let base = addr.save_base("x.html").unwrap();
    let child = base.load_base("y.html").unwrap();
    match child {
        ResourceAddress::Http(a) => {
            assert_eq!(a.host_and_port, "app:8080");
            assert_eq!(a.path, "/site/y.html");
        }
        other => panic!("expected Http, got {:?}", other),
    }
}

// ── URI dissection feeding address rewrites ─────────────────────

#[test]
fn dissected_args_round_trip_into_address() {
    let uri = DissectedUri::parse("/app;focus=w2&session=00ff/widget/path?q=1");
    let addr = ResourceAddress::Http(HttpAddress::parse("http://backend/app").unwrap());

    let with_args = addr.insert_args(&uri.args_string(), &uri.path_info);
    match &with_args {
        ResourceAddress::Http(a) => {
            assert_eq!(a.path, "/app;focus=w2&session=00ff/widget/path");
        }
        other => panic!("expected Http, got {:?}", other),
    }

    let with_query = with_args.insert_query_string_from("/x?q=1");
    match &with_query {
        ResourceAddress::Http(a) => {
            assert!(a.path.ends_with("?q=1"));
        }
        other => panic!("expected Http, got {:?}", other),
    }
}

// ── relocation over translated addresses ────────────────────────

#[test]
fn relocate_backend_redirect() {
    // a backend behind /ext-base/ redirects within its own namespace;
    // the Location must come back under the external base
    let relocated = relocate_uri(
        "http://backend:8080/int-base/login",
        "backend:8080",
        "/int-base/form",
        "https",
        "www.example.com",
        "/ext-base/form",
        "/ext-base/",
    )
    .unwrap();
    assert_eq!(relocated, "https://www.example.com/ext-base/login");
}

#[test]
fn relocate_foreign_host_is_untouched() {
    assert_eq!(
        relocate_uri(
            "http://elsewhere/x",
            "backend:8080",
            "/int/x",
            "https",
            "www.example.com",
            "/ext/x",
            "/ext/",
        ),
        None
    );
}
