use crate::{
    config::EncryptionKey, env_var, route::CALLBACK_PATH, COOKIE_AUTH_CHALLENGE_STATE_PREFIX, CSRF_COOKIE,
    SESSION_COOKIE,
};
use actix_web::{
    cookie::{Cookie, Expiration, SameSite},
    HttpRequest, HttpResponseBuilder,
};
use aes_gcm::{
    aead::{Aead, OsRng},
    AeadCore, Aes256Gcm, Key, KeyInit, Nonce,
};
use hex::FromHexError;
use std::{
    borrow::Cow,
    collections::{BTreeMap, HashSet},
    string::FromUtf8Error,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("No cookies found which matched {prefix:?}")]
    Empty { prefix: String },
    #[error("Invalid slice occurred during cookie creation")]
    InvalidSlice,
    #[error("Not able to get part number from cookie name: {cookie_name:?}")]
    InvalidPartNumber { cookie_name: String },
    #[error("{0}")]
    AesGcm(String),
    #[error("{0}")]
    HexDecode(#[from] FromHexError),
    #[error("{0}")]
    FromUtf8Error(#[from] FromUtf8Error),
}

impl From<aes_gcm::aead::Error> for ChunkerError {
    fn from(value: aes_gcm::aead::Error) -> Self {
        ChunkerError::AesGcm(value.to_string())
    }
}

pub(crate) enum CookiePath {
    All,
    Callback,
}

impl CookiePath {
    const ALL_PATH: &'static str = "/";
}

impl<'c> From<&CookiePath> for Cow<'c, str> {
    fn from(val: &CookiePath) -> Self {
        match val {
            CookiePath::All => Cow::Borrowed(CookiePath::ALL_PATH),
            CookiePath::Callback => Cow::Borrowed(CALLBACK_PATH),
        }
    }
}

/// Encrypted value spread over numbered cookies `{prefix}_1`, `{prefix}_2`, ...
/// so it stays below browser cookie size limits.
pub(crate) struct CookieChunker<'a> {
    cookie_name_prefix: &'a str,
    pub(crate) cookies: Vec<Cookie<'a>>,
}

impl<'a> CookieChunker<'a> {
    const MAX_SIZE: usize = 3_500;

    /// Cookies sent by the browser under `cookie_name_prefix` that this chunker no longer covers.
    pub(crate) fn get_dead_cookies<'c>(
        &self,
        cookies: &[Cookie<'c>],
        cookie_name_prefix: &str,
    ) -> Vec<Cookie<'c>> {
        let live: HashSet<&str> = self.cookies.iter().map(|c| c.name()).collect();

        cookies
            .iter()
            .filter(|cookie| cookie.name().starts_with(cookie_name_prefix))
            .filter(|cookie| !live.contains(cookie.name()))
            .cloned()
            .collect()
    }

    pub(crate) fn from_cookies(
        cookies: &'a [Cookie],
        cookie_name_prefix: &'a str,
    ) -> Result<Self, ChunkerError> {
        let matching: Vec<Cookie> = cookies
            .iter()
            .filter(|cookie| cookie.name().starts_with(cookie_name_prefix))
            .cloned()
            .collect();

        if matching.is_empty() {
            return Err(ChunkerError::Empty {
                prefix: cookie_name_prefix.to_string(),
            });
        }

        Ok(Self {
            cookies: matching,
            cookie_name_prefix,
        })
    }

    pub(crate) fn decrypt(&self, crypto: &CookieCrypto) -> Result<String, ChunkerError> {
        let parts = self
            .cookies
            .iter()
            .map(|cookie| {
                Self::extract_part_number(cookie.name(), self.cookie_name_prefix)
                    .map(|part| (part, cookie.value()))
            })
            .collect::<Result<BTreeMap<usize, &str>, _>>()?;

        crypto.decrypt(&parts.into_values().collect::<String>())
    }

    pub(crate) fn encrypt(
        crypto: &CookieCrypto,
        value: &str,
        cookie_name_prefix: &'a str,
        expiry: Expiration,
        path: CookiePath,
    ) -> Result<Self, ChunkerError> {
        let encrypted = crypto.encrypt(value)?;

        Self::from_string_with_size(&encrypted, cookie_name_prefix, Self::MAX_SIZE, expiry, path)
    }

    fn from_string_with_size(
        value: &str,
        cookie_name_prefix: &'a str,
        max_cookie_size: usize,
        expiry: Expiration,
        path: CookiePath,
    ) -> Result<Self, ChunkerError> {
        let cookies = split_chunks(value, max_cookie_size)?
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                Cookie::build(
                    format!("{}_{}", cookie_name_prefix, index + 1),
                    chunk.to_string(),
                )
                .http_only(true)
                .same_site(SameSite::Lax)
                .expires(expiry)
                .secure(true)
                .path(&path)
                .finish()
            })
            .collect();

        Ok(Self {
            cookies,
            cookie_name_prefix,
        })
    }

    fn extract_part_number(cookie_name: &str, prefix: &str) -> Result<usize, ChunkerError> {
        cookie_name
            .strip_prefix(prefix)
            .and_then(|suffix| suffix.trim_start_matches('_').parse::<usize>().ok())
            .ok_or_else(|| ChunkerError::InvalidPartNumber {
                cookie_name: cookie_name.to_string(),
            })
    }
}

/// Splits on character boundaries, every chunk at most `max_size` bytes.
fn split_chunks(value: &str, max_size: usize) -> Result<Vec<&str>, ChunkerError> {
    let mut chunks = Vec::new();
    let mut rest = value;

    while !rest.is_empty() {
        let mut end = rest.len().min(max_size);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            return Err(ChunkerError::InvalidSlice);
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }

    Ok(chunks)
}

pub(crate) struct CookieHelper {}

impl CookieHelper {
    pub(crate) fn session_cookie(session_id: &str) -> Cookie<'static> {
        Cookie::build(SESSION_COOKIE, session_id.to_string())
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(true)
            .path(&CookiePath::All)
            .finish()
    }

    /// Expires the session and CSRF cookies regardless of what the browser sent.
    pub(crate) fn clear_authentication_cookies(response: &mut HttpResponseBuilder) {
        for (name, http_only) in [(SESSION_COOKIE, true), (CSRF_COOKIE, false)] {
            let mut cookie = Cookie::build(name, "")
                .http_only(http_only)
                .same_site(SameSite::Lax)
                .path(&CookiePath::All)
                .finish();
            cookie.make_removal();
            response.cookie(cookie);
        }
    }

    pub(crate) fn remove_challenge_cookies(req: &HttpRequest, response: &mut HttpResponseBuilder) {
        let cookies = req
            .cookies()
            .map(|cookies| cookies.to_vec())
            .unwrap_or_default();
        Self::expire(
            response,
            cookies
                .iter()
                .filter(|cookie| cookie.name().starts_with(COOKIE_AUTH_CHALLENGE_STATE_PREFIX))
                .cloned()
                .collect(),
        );
    }

    /// Replaces the challenge cookies of an earlier, abandoned login attempt.
    pub(crate) fn replace_challenge_cookies(
        req: &HttpRequest,
        response: &mut HttpResponseBuilder,
        chunker: CookieChunker,
    ) {
        let prior = req
            .cookies()
            .map(|cookies| cookies.to_vec())
            .unwrap_or_default();
        Self::expire(
            response,
            chunker.get_dead_cookies(&prior, COOKIE_AUTH_CHALLENGE_STATE_PREFIX),
        );
        for cookie in chunker.cookies {
            response.cookie(cookie);
        }
    }

    fn expire(response: &mut HttpResponseBuilder, cookies: Vec<Cookie>) {
        for mut cookie in cookies {
            cookie.make_removal();
            cookie.set_path(&CookiePath::Callback);
            response.cookie(cookie);
        }
    }
}

/// AES-256-GCM for the login challenge cookies. Ciphertexts are hex encoded with
/// the nonce in front.
#[derive(Clone)]
pub(crate) struct CookieCrypto {
    cipher: Aes256Gcm,
}

impl CookieCrypto {
    const NONCE_SIZE: usize = 12;

    pub(crate) fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Uses the configured key, or a random one only valid within this process.
    pub(crate) fn from_config(key: Option<&EncryptionKey>) -> Self {
        match key {
            Some(key) => Self::new(key),
            None => {
                log::warn!(
                    "{} is not set, login state cookies only survive this process.",
                    env_var::ENCRYPTION_KEY
                );
                Self {
                    cipher: Aes256Gcm::new(&Aes256Gcm::generate_key(&mut OsRng)),
                }
            }
        }
    }

    pub(crate) fn encrypt(&self, plaintext: &str) -> Result<String, ChunkerError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut encrypted = nonce.to_vec();
        encrypted.extend_from_slice(&self.cipher.encrypt(&nonce, plaintext.as_bytes())?);
        Ok(hex::encode(encrypted))
    }

    pub(crate) fn decrypt(&self, ciphertext: &str) -> Result<String, ChunkerError> {
        let encrypted = hex::decode(ciphertext)?;
        if encrypted.len() < Self::NONCE_SIZE {
            return Err(ChunkerError::AesGcm("ciphertext is too short".to_string()));
        }
        let (nonce, ciphered) = encrypted.split_at(Self::NONCE_SIZE);

        let plaintext = self.cipher.decrypt(Nonce::from_slice(nonce), ciphered)?;
        String::from_utf8(plaintext).map_err(ChunkerError::FromUtf8Error)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use actix_web::{cookie::time::OffsetDateTime, http::header, test::TestRequest, HttpResponse};

    fn crypto() -> CookieCrypto {
        CookieCrypto::new(&"0123456789abcdef0123456789abcdef".parse().unwrap())
    }

    fn set_cookie_headers(mut response: HttpResponseBuilder) -> Vec<String> {
        response
            .finish()
            .headers()
            .get_all(header::SET_COOKIE)
            .map(|value| value.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_remove_challenge_cookies() {
        // Arrange
        let req = TestRequest::default()
            .cookie(Cookie::new(
                format!("{}_1", COOKIE_AUTH_CHALLENGE_STATE_PREFIX),
                "value1",
            ))
            .cookie(Cookie::new(
                format!("{}_2", COOKIE_AUTH_CHALLENGE_STATE_PREFIX),
                "value2",
            ))
            .cookie(Cookie::new(SESSION_COOKIE, "session_value"))
            .to_http_request();
        let mut response = HttpResponse::Ok();

        // Act
        CookieHelper::remove_challenge_cookies(&req, &mut response);

        // Assert
        let cookies = set_cookie_headers(response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().any(|c| c.starts_with(&format!(
            "{}_1=; Path={}; Max-Age=0",
            COOKIE_AUTH_CHALLENGE_STATE_PREFIX, CALLBACK_PATH
        ))));
        assert!(!cookies.iter().any(|c| c.starts_with(SESSION_COOKIE)));
    }

    #[test]
    fn test_clear_authentication_cookies() {
        let mut response = HttpResponse::Ok();

        CookieHelper::clear_authentication_cookies(&mut response);

        let cookies = set_cookie_headers(response);
        let session = cookies
            .iter()
            .find(|c| c.starts_with("BFFSESSIONID=;"))
            .unwrap();
        let csrf = cookies
            .iter()
            .find(|c| c.starts_with("XSRF-TOKEN=;"))
            .unwrap();
        assert!(session.contains("Max-Age=0"));
        assert!(session.contains("Path=/"));
        assert!(session.contains("HttpOnly"));
        assert!(csrf.contains("Max-Age=0"));
        assert!(!csrf.contains("HttpOnly"));
        assert!(csrf.contains("Path=/"));
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = CookieHelper::session_cookie("abc");

        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "abc");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
    }

    #[test]
    fn test_replace_challenge_cookies() {
        // Arrange
        let req = TestRequest::default()
            .cookie(Cookie::new(
                format!("{}_1", COOKIE_AUTH_CHALLENGE_STATE_PREFIX),
                "old1",
            ))
            .cookie(Cookie::new(
                format!("{}_2", COOKIE_AUTH_CHALLENGE_STATE_PREFIX),
                "old2",
            ))
            .to_http_request();
        let chunker = CookieChunker::from_string_with_size(
            "fresh",
            COOKIE_AUTH_CHALLENGE_STATE_PREFIX,
            10,
            Expiration::Session,
            CookiePath::Callback,
        )
        .unwrap();
        let mut response = HttpResponse::TemporaryRedirect();

        // Act
        CookieHelper::replace_challenge_cookies(&req, &mut response, chunker);

        // Assert
        let cookies = set_cookie_headers(response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().any(|c| c.starts_with(&format!(
            "{}_2=; Path={}; Max-Age=0",
            COOKIE_AUTH_CHALLENGE_STATE_PREFIX, CALLBACK_PATH
        ))));
        assert!(cookies.iter().any(|c| c.starts_with(&format!(
            "{}_1=fresh",
            COOKIE_AUTH_CHALLENGE_STATE_PREFIX
        ))));
    }

    #[test]
    fn test_get_dead_cookies() {
        // Arrange
        let chunker = CookieChunker {
            cookie_name_prefix: "test_cookie",
            cookies: vec![
                Cookie::new("test_cookie_1", "chunker_value1"),
                Cookie::new("test_cookie_2", "chunker_value2"),
            ],
        };
        let prior_cookies = vec![
            Cookie::new("test_cookie_1", "passed_value1"),
            Cookie::new("test_cookie_3", "passed_value3"),
            Cookie::new("other_cookie_1", "passed_value4"),
        ];

        // Act
        let dead_cookies = chunker.get_dead_cookies(&prior_cookies, "test_cookie");

        // Assert
        assert_eq!(dead_cookies.len(), 1);
        assert_eq!(dead_cookies[0].name(), "test_cookie_3");
    }

    #[test]
    fn test_cookie_attributes() {
        // Arrange
        let expiry = Expiration::DateTime(OffsetDateTime::now_utc());

        // Act
        let chunker = CookieChunker::from_string_with_size(
            "This is a test string that will be split into multiple cookies.",
            "test_cookie",
            10,
            expiry,
            CookiePath::Callback,
        )
        .unwrap();

        // Assert
        assert_eq!(chunker.cookies.len(), 7);
        for cookie in chunker.cookies {
            assert_eq!(cookie.http_only(), Some(true));
            assert_eq!(cookie.same_site(), Some(SameSite::Lax));
            assert_eq!(cookie.secure(), Some(true));
            assert_eq!(cookie.path(), Some(CALLBACK_PATH));
            assert_eq!(
                cookie.expires().unwrap().datetime().unwrap(),
                expiry.datetime().unwrap()
            );
        }
    }

    macro_rules! test_from_string_with_size {
        ($name:ident, $value:expr, $max_cookie_size:expr, $expected_values:expr) => {
            #[test]
            fn $name() {
                let chunker = CookieChunker::from_string_with_size(
                    $value,
                    "test_cookie",
                    $max_cookie_size,
                    Expiration::Session,
                    CookiePath::All,
                )
                .unwrap();

                let values: Vec<&str> = chunker.cookies.iter().map(|c| c.value()).collect();
                assert_eq!(values, $expected_values);
                for (i, cookie) in chunker.cookies.iter().enumerate() {
                    assert_eq!(cookie.name(), format!("test_cookie_{}", i + 1));
                }
            }
        };
    }

    test_from_string_with_size!(
        test_ascii_string,
        "Hello, world! This is a test string.",
        5,
        vec!["Hello", ", wor", "ld! T", "his i", "s a t", "est s", "tring", "."]
    );

    test_from_string_with_size!(
        test_multibyte_string,
        "こんにちは世界",
        8,
        vec!["こん", "にち", "は世", "界"]
    );

    #[test]
    fn test_chunk_smaller_than_character() {
        let result = split_chunks("こ", 2);

        assert!(matches!(result, Err(ChunkerError::InvalidSlice)));
    }

    #[test]
    fn test_decrypt_out_of_order_parts() {
        // Arrange
        let crypto = crypto();
        let encrypted = crypto.encrypt("pkce verifier and nonce").unwrap();
        let (first, second) = encrypted.split_at(20);
        let chunker = CookieChunker {
            cookie_name_prefix: "test_cookie",
            cookies: vec![
                Cookie::new("test_cookie_2", second),
                Cookie::new("test_cookie_1", first),
            ],
        };

        // Act
        let result = chunker.decrypt(&crypto);

        // Assert
        assert_eq!(result.unwrap(), "pkce verifier and nonce");
    }

    #[test]
    fn test_decrypt_invalid_part_number() {
        let chunker = CookieChunker {
            cookie_name_prefix: "test_cookie",
            cookies: vec![
                Cookie::new("test_cookie_1", "part"),
                Cookie::new("test_cookie_foo", "invalid"),
            ],
        };

        let result = chunker.decrypt(&crypto());

        assert!(matches!(
            result,
            Err(ChunkerError::InvalidPartNumber { cookie_name }) if cookie_name == "test_cookie_foo"
        ));
    }

    #[test]
    fn test_decrypt_tampered_value() {
        let crypto = crypto();
        let mut encrypted = crypto.encrypt("state").unwrap();
        encrypted.replace_range(30..32, if &encrypted[30..32] == "00" { "11" } else { "00" });

        assert!(matches!(
            crypto.decrypt(&encrypted),
            Err(ChunkerError::AesGcm(_))
        ));
        assert!(matches!(
            crypto.decrypt("abcd"),
            Err(ChunkerError::AesGcm(_))
        ));
    }

    #[test]
    fn test_configured_key_is_shared_between_instances() {
        let encrypted = crypto().encrypt("state").unwrap();

        let same_key = crypto().decrypt(&encrypted);
        let generated_key = CookieCrypto::from_config(None).decrypt(&encrypted);

        assert_eq!(same_key.unwrap(), "state");
        assert!(matches!(generated_key, Err(ChunkerError::AesGcm(_))));
    }

    #[test]
    fn test_from_cookies_no_matches() {
        let cookies = [Cookie::new("other_cookie_1", "value1")];

        let chunker = CookieChunker::from_cookies(&cookies, "test_cookie");

        assert!(
            matches!(chunker, Err(ChunkerError::Empty { prefix }) if prefix == "test_cookie")
        );
    }
}
