//! Tag listing with `Link`-header pagination.

use std::collections::VecDeque;

use url::Url;

use super::{unexpected_status, Operation, Registry};
use crate::errors::{Error, Result};
use crate::models::Tags;
use crate::reference::Reference;
use crate::transport::TransportRequest;

impl Registry {
    /// All tags of a repository, draining every page.
    pub fn get_tags(&self, reference: &Reference) -> Result<Vec<String>> {
        self.tags(reference, None).collect()
    }

    /// Lazy sequence over `/v2/<name>/tags/list`. Pages are fetched
    /// on demand, following `Link: <…>; rel="next"` until it is gone.
    pub fn tags(&self, reference: &Reference, page_size: Option<usize>) -> TagIterator<'_> {
        let host = self.host_for(reference);
        let mut url = self.v2_url(host, &format!("{}/tags/list", reference.repository));

        if let Some(n) = page_size {
            url.push_str(&format!("?n={n}"));
        }

        TagIterator {
            registry: self,
            reference: reference.clone(),
            next_url: Some(url),
            buffer: VecDeque::new(),
            done: false,
        }
    }
}

pub struct TagIterator<'a> {
    registry: &'a Registry,
    reference: Reference,
    next_url: Option<String>,
    buffer: VecDeque<String>,
    done: bool,
}

impl TagIterator<'_> {
    fn fetch_page(&mut self) -> Result<()> {
        let Some(url) = self.next_url.take() else {
            self.done = true;
            return Ok(());
        };

        let request = TransportRequest::new("GET", url.clone());
        let response = self
            .registry
            .execute(&self.reference, Operation::Pull, request)?;

        match response.status() {
            200 => {}
            404 => return Err(Error::NotFound(self.reference.to_string())),
            _ => return Err(unexpected_status(response)),
        }

        self.next_url = next_link(response.header("Link")).and_then(|link| {
            Url::parse(&url)
                .and_then(|base| base.join(&link))
                .map(String::from)
                .ok()
        });

        if self.next_url.is_none() {
            self.done = true;
        }

        let page: Tags = serde_json::from_reader(response.into_reader())?;
        self.buffer.extend(page.tags);

        Ok(())
    }
}

impl Iterator for TagIterator<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tag) = self.buffer.pop_front() {
                return Some(Ok(tag));
            }

            if self.done {
                return None;
            }

            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Target of the `rel="next"` entry in a `Link` header.
fn next_link(header: Option<&str>) -> Option<String> {
    for entry in header?.split(',') {
        let entry = entry.trim();

        let Some(end) = entry.find('>') else {
            continue;
        };

        let Some(target) = entry.strip_prefix('<').map(|rest| &rest[..end - 1]) else {
            continue;
        };

        let is_next = entry[end + 1..]
            .split(';')
            .any(|param| matches!(param.trim(), r#"rel="next""# | "rel=next"));

        if is_next {
            return Some(target.to_owned());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_header_next_target() {
        assert_eq!(
            next_link(Some(r#"</v2/library/x/tags/list?last=b&n=2>; rel="next""#)),
            Some("/v2/library/x/tags/list?last=b&n=2".to_owned()),
        );

        assert_eq!(
            next_link(Some(r#"<https://reg/v2/x/tags/list?last=z>; rel=next"#)),
            Some("https://reg/v2/x/tags/list?last=z".to_owned()),
        );

        assert_eq!(next_link(Some(r#"</other>; rel="prev""#)), None);
        assert_eq!(next_link(None), None);
    }
}
