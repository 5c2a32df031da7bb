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

//! # duelrank metrics
//!
//! duelrank uses [OpenTelemetry] to collect metrics & exposes them in Prometheus text format at
//! `/metrics`. The actual counters ("instruments" in OTel-speak) are meant to be created once and
//! reused; rather than litter the application state with fields of type `Counter<u64>`, each
//! collection site declares its instrument in place with [define_metric!] and David Tolnay's
//! [inventory] crate keeps the decentralized list honest: [check_metric_registrations] runs at
//! startup & panics on a name collision. A bad metric name is a logic error, and I'd rather hear
//! about it at boot than have a ticking time bomb in a little-used code path.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! define_metric! { "vote.accepted", votes_accepted, Sort::IntegralCounter }
//! // ...
//! votes_accepted.add(1, &[]);
//! ```

use std::collections::HashSet;

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    // more later?
}

/// The thing being inventoried: one metric name & its instrument type
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic on duplicate metric names; call once at startup
pub fn check_metric_registrations() {
    let mut names: HashSet<&'static str> = HashSet::new();
    for reg in inventory::iter::<Registration> {
        if !names.insert(reg.name()) {
            panic!("the metric name {} was registered twice", reg.name());
        }
    }
}

/// Declare a counter in place: registers the name with [inventory] & binds a lazy static
/// instrument to `$ident`
#[macro_export]
macro_rules! define_metric {
    ($name:expr, $ident:ident, $sort:path) => {
        inventory::submit! { $crate::metrics::Registration::new($name, $sort) }
        lazy_static::lazy_static! {
            static ref $ident: opentelemetry::metrics::Counter<u64> =
                opentelemetry::global::meter("duelrank").u64_counter($name).build();
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registrations_are_unique() {
        check_metric_registrations();
    }

    #[test]
    fn registration_accessors() {
        let reg = Registration::new("test.metric", Sort::IntegralCounter);
        assert_eq!(reg.name(), "test.metric");
        assert_eq!(reg.sort(), Sort::IntegralCounter);
    }
}
