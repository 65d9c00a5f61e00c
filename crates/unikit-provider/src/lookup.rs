use crate::ProviderError;
use unikit_schema::{Image, Instance, Volume};

/// A ledger resource addressable by id or name.
pub trait Resource {
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn name(&self) -> &str;
}

impl Resource for Image {
    const KIND: &'static str = "image";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for Instance {
    const KIND: &'static str = "instance";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for Volume {
    const KIND: &'static str = "volume";

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Resolve `query` against a listing.
///
/// An exact id wins, then an exact name, then a substring of either id or
/// name. A substring that matches more than one resource is rejected as
/// ambiguous instead of silently picking one.
pub fn find_by_name_or_id<T: Resource>(items: Vec<T>, query: &str) -> Result<T, ProviderError> {
    let not_found = || ProviderError::NotFound {
        kind: T::KIND,
        query: query.to_owned(),
    };
    if query.is_empty() {
        return Err(not_found());
    }

    if let Some(pos) = items.iter().position(|r| r.id() == query) {
        return items.into_iter().nth(pos).ok_or_else(not_found);
    }
    if let Some(pos) = items.iter().position(|r| r.name() == query) {
        return items.into_iter().nth(pos).ok_or_else(not_found);
    }

    let mut matches: Vec<T> = items
        .into_iter()
        .filter(|r| r.id().contains(query) || r.name().contains(query))
        .collect();
    match matches.len() {
        0 => Err(not_found()),
        1 => matches.pop().ok_or_else(not_found),
        _ => {
            let mut candidates: Vec<String> = matches
                .iter()
                .map(|r| format!("{} ({})", r.name(), r.id()))
                .collect();
            candidates.sort();
            Err(ProviderError::Ambiguous {
                kind: T::KIND,
                query: query.to_owned(),
                candidates: candidates.join(", "),
            })
        }
    }
}
