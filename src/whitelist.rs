use std::collections::HashSet;

use log::trace;

use crate::address;

/// Fixed allow-list of device identities, compared in canonical form.
#[derive(Debug, Clone)]
pub struct Whitelist {
    // `None` admits every address.
    allowed: Option<HashSet<String>>,
}

impl Whitelist {
    pub fn from_addresses<I, A>(addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        let allowed = addresses
            .into_iter()
            .map(|a| address::canonical(a.as_ref()))
            .collect();
        Whitelist {
            allowed: Some(allowed),
        }
    }

    pub fn allow_all() -> Self {
        Whitelist { allowed: None }
    }

    pub fn allow(&self, address: &str) -> bool {
        let Some(allowed) = &self.allowed else {
            return true;
        };
        let admitted = allowed.contains(&address::canonical(address));
        if !admitted {
            trace!("Ignoring device outside whitelist: {address}");
        }
        admitted
    }

    pub fn entries(&self) -> Option<usize> {
        self.allowed.as_ref().map(HashSet::len)
    }
}
