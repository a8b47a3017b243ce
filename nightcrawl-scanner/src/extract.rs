use crate::result::{ExtractedLink, Indicators, NonHttpLink, host_of};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use url::Url;

static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("title selector"));
static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("link selector"));

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex")
});
static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").expect("ipv4 regex"));
static BTC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b").expect("btc regex")
});
static ETH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").expect("eth regex"));
static CHATROOM_HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(irc|xmpp|webchat|discord|telegram|signal|chatroom|channel)\..+")
        .expect("chatroom regex")
});

const NON_HTTP_SCHEMES: &[&str] = &["mailto:", "irc://", "ircs://", "xmpp:"];

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.5; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
];

/// Round-robin over a fixed set of User-Agent strings.
#[derive(Debug, Default)]
pub struct UserAgentPool {
    next: AtomicUsize,
}

impl UserAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_agent(&self) -> &'static str {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageData {
    pub title: Option<String>,
    pub links: Vec<ExtractedLink>,
    pub indicators: Indicators,
}

pub fn extract_page(html: &str, base: &Url) -> PageData {
    let document = Html::parse_document(html);
    let base_host = host_of(base);

    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let mut links = Vec::new();
    let mut seen = BTreeSet::new();
    let mut non_http = Vec::new();
    let mut chatrooms = BTreeSet::new();

    for element in document.select(&LINK_SELECTOR) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();

        if let Some(link) = non_http_link(href) {
            if !non_http.contains(&link) {
                non_http.push(link);
            }
            continue;
        }

        let Some(resolved) = resolve_url(base, href) else {
            continue;
        };

        let host = host_of(&resolved);
        if CHATROOM_HOST_RE.is_match(&host) {
            chatrooms.insert(resolved.to_string());
        }

        if seen.insert(resolved.to_string()) {
            debug!("Found link: {}", resolved);
            links.push(ExtractedLink {
                url: resolved.to_string(),
                text: collapse_whitespace(&element.text().collect::<String>()),
                is_external: host != base_host,
            });
        }
    }

    let mut indicators = extract_indicators(html);
    indicators.chatrooms = chatrooms.into_iter().collect();
    indicators.non_http_links = non_http;

    PageData {
        title,
        links,
        indicators,
    }
}

/// Emails, IPv4 addresses and crypto addresses found anywhere in the text.
pub fn extract_indicators(text: &str) -> Indicators {
    let collect = |re: &Regex| -> Vec<String> {
        re.find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };

    let ips = IPV4_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|ip| ip.split('.').all(|octet| octet.parse::<u8>().is_ok()))
        .map(String::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Indicators {
        emails: collect(&EMAIL_RE),
        ips,
        btc_addresses: collect(&BTC_RE),
        eth_addresses: collect(&ETH_RE),
        ..Indicators::default()
    }
}

/// Resolve an href against the page URL. Only http(s) targets survive;
/// fragments are stripped.
pub fn resolve_url(base: &Url, href: &str) -> Option<Url> {
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
        || href.starts_with('#')
    {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

fn non_http_link(href: &str) -> Option<NonHttpLink> {
    let lower = href.to_ascii_lowercase();
    let scheme = NON_HTTP_SCHEMES.iter().find(|s| lower.starts_with(*s))?;
    let kind = scheme.trim_end_matches(['/', ':']).to_string();
    Some(NonHttpLink {
        kind,
        value: href.to_string(),
    })
}

const INVISIBLE_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Human-readable text of a document: text nodes outside script, style,
/// noscript and template elements, whitespace collapsed.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| INVISIBLE_ELEMENTS.contains(&e.name()))
        });
        if !hidden {
            parts.push(text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://forum.onion/threads/").unwrap()
    }

    #[test]
    fn test_title_and_links() {
        let html = r##"<html><head><title>  Hidden
            Forum </title></head><body>
            <a href="/threads/1">First   thread</a>
            <a href="http://market.onion/shop#top">Market</a>
            <a href="/threads/1">dup</a>
            <a href="javascript:void(0)">nope</a>
            <a href="#anchor">anchor</a>
            </body></html>"##;

        let page = extract_page(html, &base());
        assert_eq!(page.title.as_deref(), Some("Hidden Forum"));
        assert_eq!(page.links.len(), 2);

        assert_eq!(page.links[0].url, "http://forum.onion/threads/1");
        assert_eq!(page.links[0].text, "First thread");
        assert!(!page.links[0].is_external);

        assert_eq!(page.links[1].url, "http://market.onion/shop");
        assert!(page.links[1].is_external);
    }

    #[test]
    fn test_non_http_links_collected_separately() {
        let html = r#"<a href="mailto:admin@forum.onion">mail</a>
            <a href="irc://irc.example.net/#darkchat">irc</a>
            <a href="xmpp:trader@jabber.example">xmpp</a>"#;
        let page = extract_page(html, &base());

        assert!(page.links.is_empty());
        let kinds: Vec<&str> = page
            .indicators
            .non_http_links
            .iter()
            .map(|l| l.kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["mailto", "irc", "xmpp"]);
        assert!(page.indicators.emails.contains(&"admin@forum.onion".to_string()));
    }

    #[test]
    fn test_chatroom_hosts() {
        let html = r#"<a href="https://telegram.example.org/join">tg</a>
            <a href="https://news.example.org/">news</a>"#;
        let page = extract_page(html, &base());
        assert_eq!(
            page.indicators.chatrooms,
            vec!["https://telegram.example.org/join".to_string()]
        );
        assert_eq!(page.links.len(), 2);
    }

    #[test]
    fn test_indicators() {
        let text = "Contact vendor@mail.example.com or ops@mail.example.com. \
            Server 10.0.0.12, not 999.1.1.1. \
            BTC 1BoatSLRHtKNngkdXEeobR76b53LETtpyT \
            ETH 0x52908400098527886E0F7030069857D2E4169EE7";

        let found = extract_indicators(text);
        assert_eq!(found.emails.len(), 2);
        assert_eq!(found.ips, vec!["10.0.0.12".to_string()]);
        assert_eq!(
            found.btc_addresses,
            vec!["1BoatSLRHtKNngkdXEeobR76b53LETtpyT".to_string()]
        );
        assert_eq!(found.eth_addresses.len(), 1);
    }

    #[test]
    fn test_visible_text_skips_markup_and_styles() {
        let html = r#"<html><head><title>Garden</title>
            <style>li:first-child { margin: 0 }</style>
            <script>var target = "child";</script></head>
            <body><p>Welcome to my   <b>gardening</b> blog.</p></body></html>"#;

        let text = visible_text(html);
        assert_eq!(text, "Garden Welcome to my gardening blog.");
        assert!(!text.contains("child"));
    }

    #[test]
    fn test_no_indicators() {
        let found = extract_indicators("<p>Nothing to see here.</p>");
        assert!(found.is_empty());
    }

    #[test]
    fn test_user_agent_rotation() {
        let pool = UserAgentPool::new();
        let first = pool.next_agent();
        let second = pool.next_agent();
        assert_ne!(first, second);
        for _ in 2..USER_AGENTS.len() {
            pool.next_agent();
        }
        assert_eq!(pool.next_agent(), first);
    }
}
