//! HTTP cookies.
//!
//! The model keeps serialization deliberately plain: nothing is quoted,
//! values are percent-encoded, and attributes are emitted in a fixed
//! order (domain, path, expires, max-age, secure, http-only).

use std::{
    fmt,
    sync::RwLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};

/// Octets percent-encoded inside cookie values.
const COOKIE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\')
    .add(b'%');

/// A single HTTP cookie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    expires: Option<SystemTime>,
    max_age: Option<Duration>,
    secure: bool,
    http_only: bool,
}

impl Cookie {
    /// Creates a new cookie from a name and value.
    pub fn new<N, V>(name: N, value: V) -> Cookie
    where
        N: Into<String>,
        V: Into<String>,
    {
        Cookie {
            name: name.into(),
            value: value.into(),
            ..Cookie::default()
        }
    }

    /// The name of the cookie.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value of the cookie.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the domain directive, if set.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Returns the path directive, if set.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns the expiration time, if set.
    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    /// Returns the Max-Age directive, if set.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// Returns true if the 'Secure' directive is enabled.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Returns true if the 'HttpOnly' directive is enabled.
    pub fn http_only(&self) -> bool {
        self.http_only
    }

    /// Sets the domain directive.
    pub fn with_domain<S: Into<String>>(mut self, domain: S) -> Cookie {
        self.domain = Some(domain.into());
        self
    }

    /// Sets the path directive.
    pub fn with_path<S: Into<String>>(mut self, path: S) -> Cookie {
        self.path = Some(path.into());
        self
    }

    /// Sets the expiration time.
    pub fn with_expires(mut self, at: SystemTime) -> Cookie {
        self.expires = Some(at);
        self
    }

    /// Sets the Max-Age directive.
    pub fn with_max_age(mut self, dur: Duration) -> Cookie {
        self.max_age = Some(dur);
        self
    }

    /// Enables the Secure directive.
    pub fn with_secure(mut self, secure: bool) -> Cookie {
        self.secure = secure;
        self
    }

    /// Enables the HttpOnly directive.
    pub fn with_http_only(mut self, http_only: bool) -> Cookie {
        self.http_only = http_only;
        self
    }

    /// Serializes into a `Set-Cookie` header value.
    pub fn to_set_cookie(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + self.value.len() + 16);
        out.push_str(&self.name);
        out.push('=');
        out.push_str(&utf8_percent_encode(&self.value, COOKIE_VALUE).to_string());
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&fmt_http_date(expires));
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.as_secs().to_string());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }

    /// Parses a `Set-Cookie` header value. Unknown attributes are
    /// ignored; a missing `=` in the pair position fails.
    pub fn parse_set_cookie(header: &str) -> Option<Cookie> {
        let mut parts = header.split(';');
        let pair = parts.next()?.trim();
        let eq = pair.find('=')?;
        let name = pair[..eq].trim();
        if name.is_empty() {
            return None;
        }
        let value = decode_value(pair[eq + 1..].trim());
        let mut cookie = Cookie::new(name, value);
        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.find('=') {
                Some(i) => (&attr[..i], attr[i + 1..].trim()),
                None => (attr, ""),
            };
            if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
                cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
            } else if key.eq_ignore_ascii_case("path") && !val.is_empty() {
                cookie.path = Some(val.to_owned());
            } else if key.eq_ignore_ascii_case("expires") {
                cookie.expires = parse_http_date(val);
            } else if key.eq_ignore_ascii_case("max-age") {
                cookie.max_age = val.parse::<u64>().ok().map(Duration::from_secs);
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if key.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            }
        }
        Some(cookie)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}",
            self.name,
            utf8_percent_encode(&self.value, COOKIE_VALUE)
        )
    }
}

fn decode_value(raw: &str) -> String {
    percent_decode(raw.as_bytes())
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_owned())
}

/// Parses a `Cookie:` request header into name/value pairs.
///
/// Pairs are split on `;`, whitespace is trimmed and values are
/// percent-decoded. A bare name without `=` yields the value `"1"`.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for pair in header.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.find('=') {
            Some(eq) => {
                let name = pair[..eq].trim();
                if !name.is_empty() {
                    out.push((name.to_owned(), decode_value(pair[eq + 1..].trim())));
                }
            }
            None => out.push((pair.to_owned(), "1".to_owned())),
        }
    }
    out
}

/// Serializes pairs into a `Cookie:` request header value.
pub fn format_cookie_header<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (name, value) in pairs {
        if !out.is_empty() {
            out.push_str("; ");
        }
        out.push_str(name);
        out.push('=');
        out.push_str(&utf8_percent_encode(value, COOKIE_VALUE).to_string());
    }
    out
}

/// Actions for a persistent cookie store providing session support.
pub trait CookieStore: Send + Sync {
    /// Store the `Set-Cookie` header values received from `url`.
    fn set_cookies(&self, headers: &mut dyn Iterator<Item = &str>, url: &url::Url);

    /// Get a `Cookie:` header value for `url`, if any cookies match.
    fn cookies(&self, url: &url::Url) -> Option<String>;
}

/// A good default `CookieStore` implementation.
///
/// This is the implementation used when simply configuring a client with
/// `cookie_store(true)`. It can be created up front and filled with
/// existing cookies before building a `Client`.
#[derive(Debug, Default)]
pub struct Jar {
    store: RwLock<Vec<Stored>>,
}

#[derive(Debug)]
struct Stored {
    cookie: Cookie,
    host: String,
}

impl Jar {
    /// Creates an empty jar.
    pub fn new() -> Jar {
        Jar::default()
    }

    /// Adds a cookie to the jar as if it had been received from `url`.
    pub fn add_cookie(&self, cookie: Cookie, url: &url::Url) {
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return,
        };
        let mut store = self.store.write().expect("jar lock poisoned");
        store.retain(|s| !(s.cookie.name == cookie.name && s.host == host));
        store.push(Stored { cookie, host });
    }

    fn matches(stored: &Stored, url: &url::Url, now: SystemTime) -> bool {
        if let Some(expires) = stored.cookie.expires {
            if expires <= now {
                return false;
            }
        }
        if stored.cookie.secure && url.scheme() != "https" {
            return false;
        }
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        };
        let domain_ok = match &stored.cookie.domain {
            Some(domain) => host == *domain || host.ends_with(&format!(".{domain}")),
            None => host == stored.host,
        };
        if !domain_ok {
            return false;
        }
        let path = stored.cookie.path.as_deref().unwrap_or("/");
        let url_path = url.path();
        url_path == path
            || (url_path.starts_with(path)
                && (path.ends_with('/') || url_path.as_bytes().get(path.len()) == Some(&b'/')))
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, headers: &mut dyn Iterator<Item = &str>, url: &url::Url) {
        for header in headers {
            if let Some(cookie) = Cookie::parse_set_cookie(header) {
                self.add_cookie(cookie, url);
            }
        }
    }

    fn cookies(&self, url: &url::Url) -> Option<String> {
        let now = SystemTime::now();
        let store = self.store.read().expect("jar lock poisoned");
        let header = format_cookie_header(
            store
                .iter()
                .filter(|s| Jar::matches(s, url, now))
                .map(|s| (s.cookie.name.as_str(), s.cookie.value.as_str())),
        );
        if header.is_empty() {
            None
        } else {
            Some(header)
        }
    }
}

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Formats a timestamp as an IMF-fixdate, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub(crate) fn fmt_http_date(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    // 1970-01-01 was a Thursday
    let weekday = (days + 3).rem_euclid(7) as usize;
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[weekday],
        day,
        MONTH_NAMES[(month - 1) as usize],
        year,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

/// Parses an IMF-fixdate. Obsolete RFC 850 and asctime forms are not
/// accepted; they have been rare in Set-Cookie for decades.
pub(crate) fn parse_http_date(s: &str) -> Option<SystemTime> {
    // "Sun, 06 Nov 1994 08:49:37 GMT"
    let s = s.trim();
    let rest = s.split_once(", ").map(|(_, r)| r).unwrap_or(s);
    let mut fields = rest.split_ascii_whitespace();
    let day: i64 = fields.next()?.parse().ok()?;
    let month_name = fields.next()?;
    let month = MONTH_NAMES.iter().position(|m| *m == month_name)? as i64 + 1;
    let year: i64 = fields.next()?.parse().ok()?;
    let mut hms = fields.next()?.split(':');
    let hour: i64 = hms.next()?.parse().ok()?;
    let minute: i64 = hms.next()?.parse().ok()?;
    let second: i64 = hms.next()?.parse().ok()?;
    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

// Calendar conversions by Howard Hinnant's civil-days algorithm.
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_attribute_order() {
        let cookie = Cookie::new("sid", "abc def")
            .with_domain("example.com")
            .with_path("/app")
            .with_max_age(Duration::from_secs(3600))
            .with_secure(true)
            .with_http_only(true);
        assert_eq!(
            cookie.to_set_cookie(),
            "sid=abc%20def; Domain=example.com; Path=/app; Max-Age=3600; Secure; HttpOnly"
        );
    }

    #[test]
    fn parse_cookie_header_pairs() {
        let pairs = parse_cookie_header("a=1;  b=two%20words; flag ; c=");
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "two words".to_owned()),
                ("flag".to_owned(), "1".to_owned()),
                ("c".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn set_cookie_roundtrip() {
        let cookie = Cookie::parse_set_cookie(
            "token=v%3B1; Domain=.Example.COM; Path=/; Secure; HttpOnly; Max-Age=60",
        )
        .unwrap();
        assert_eq!(cookie.name(), "token");
        assert_eq!(cookie.value(), "v;1");
        assert_eq!(cookie.domain(), Some("example.com"));
        assert_eq!(cookie.path(), Some("/"));
        assert!(cookie.secure());
        assert!(cookie.http_only());
        assert_eq!(cookie.max_age(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn http_date_roundtrip() {
        let formatted = "Sun, 06 Nov 1994 08:49:37 GMT";
        let parsed = parse_http_date(formatted).unwrap();
        assert_eq!(fmt_http_date(parsed), formatted);

        let epoch = fmt_http_date(UNIX_EPOCH);
        assert_eq!(epoch, "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn jar_matches_domain_and_path() {
        let jar = Jar::new();
        let url = url::Url::parse("http://shop.example.com/cart/items").unwrap();
        jar.set_cookies(
            &mut ["sid=1; Domain=example.com; Path=/cart"].into_iter(),
            &url,
        );

        assert_eq!(jar.cookies(&url), Some("sid=1".to_owned()));

        let sub = url::Url::parse("http://api.example.com/cart").unwrap();
        assert_eq!(jar.cookies(&sub), Some("sid=1".to_owned()));

        let other_path = url::Url::parse("http://shop.example.com/admin").unwrap();
        assert_eq!(jar.cookies(&other_path), None);

        let other_host = url::Url::parse("http://example.org/cart").unwrap();
        assert_eq!(jar.cookies(&other_host), None);
    }

    #[test]
    fn jar_respects_secure_flag() {
        let jar = Jar::new();
        let https = url::Url::parse("https://example.com/").unwrap();
        jar.set_cookies(&mut ["s=1; Secure"].into_iter(), &https);
        assert_eq!(jar.cookies(&https), Some("s=1".to_owned()));
        let http = url::Url::parse("http://example.com/").unwrap();
        assert_eq!(jar.cookies(&http), None);
    }

    #[test]
    fn host_only_cookie_does_not_leak_to_subdomains() {
        let jar = Jar::new();
        let url = url::Url::parse("http://example.com/").unwrap();
        jar.set_cookies(&mut ["s=1"].into_iter(), &url);
        let sub = url::Url::parse("http://www.example.com/").unwrap();
        assert_eq!(jar.cookies(&sub), None);
        assert_eq!(jar.cookies(&url), Some("s=1".to_owned()));
    }
}
