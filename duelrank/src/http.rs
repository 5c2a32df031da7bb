// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of duelrank.
//
// duelrank is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// duelrank is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with duelrank.  If not,
// see <http://www.gnu.org/licenses/>.

//! # assorted http utilities
//!
//! Low-level HTTP-related pieces that don't depend on much of anything else: the standard error
//! body, the silent-success body, cookie plumbing & client-IP extraction.

use axum::Json;
use serde::{Deserialize, Serialize};

use crate::users;

/// A serializable struct for use in HTTP error responses
///
/// This may be a violation of the YAGNI! principle, but I'd like every error to carry a JSON
/// body. I can't see a way to *enforce* that all handlers do this, but I can at least set up a
/// standard representation.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl ErrorResponseBody {
    pub fn new<S: Into<String>>(error: S) -> ErrorResponseBody {
        ErrorResponseBody {
            error: error.into(),
        }
    }
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// The generic success body
#[derive(Debug, Deserialize, Serialize)]
pub struct GenericRsp {
    pub message: String,
}

/// The one-and-only body returned on *every* silent-fail path (bad signature, replayed pair id,
/// invalid identity). A single constant prevents the bodies themselves from leaking which check
/// failed.
pub const SILENT_SUCCESS_BODY: &str = "vote recorded";

pub fn silent_success() -> Json<GenericRsp> {
    Json(GenericRsp {
        message: SILENT_SUCCESS_BODY.to_owned(),
    })
}

/// Pull the identity out of the Cookie header; empty string if absent
///
/// No validation here — callers decide whether an invalid identity downgrades to anonymous
/// (vote, report) or triggers a re-mint (pair).
pub fn user_id_from_headers(headers: &http::HeaderMap) -> String {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == users::COOKIE_NAME).then(|| value.trim().to_owned())
        })
        .next()
        .unwrap_or_default()
}

/// The Set-Cookie header value minting a fresh identity
pub fn identity_cookie(user_id: &str) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        users::COOKIE_NAME,
        user_id,
        users::COOKIE_MAX_AGE_SECS
    )
}

/// Best-effort client IP: leftmost `X-Forwarded-For` entry, falling back to the socket address
pub fn client_ip(headers: &http::HeaderMap, peer: std::net::SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_owned())
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cookie_extraction() {
        let mut headers = http::HeaderMap::new();
        assert_eq!(user_id_from_headers(&headers), "");
        headers.insert(
            http::header::COOKIE,
            "theme=dark; user-id=0190b5a2-7d71-7bd0-b1d5-9a31c889a4b1; lang=en"
                .parse()
                .unwrap(),
        );
        assert_eq!(
            user_id_from_headers(&headers),
            "0190b5a2-7d71-7bd0-b1d5-9a31c889a4b1"
        );
    }

    #[test]
    fn minted_cookies_carry_the_attributes() {
        let cookie = identity_cookie("abc");
        assert!(cookie.starts_with("user-id=abc;"));
        assert!(cookie.contains("Max-Age=31536000"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn forwarded_ips_win_over_the_peer() {
        let peer: std::net::SocketAddr = "192.0.2.7:1234".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "192.0.2.7");
        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "203.0.113.5");
    }
}
