//! Cursor pagination over modify-index ordered listings.
//!
//! A cursor is the decimal modify index of the first item of the next page.
//! Cursors compare numerically, so a listing that crosses from `999` to
//! `1000` pages in the same order it sorts.
//!
//! Items written together share a modify index. When a page ends inside such
//! a run the cursor becomes `<index>.<id>` and the listing resumes at that
//! exact item.

use std::cmp::Ordering;

use crate::envelope::QueryOptions;
use crate::error::RpcError;

/// An item that can be listed page by page.
pub trait Paged {
    fn modify_index(&self) -> u64;

    /// Orders items that share a modify index.
    fn cursor_id(&self) -> &str;
}

type Filter<'a, T> = Box<dyn Fn(&T) -> bool + Send + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cursor {
    index: u64,
    id: Option<String>,
}

impl Cursor {
    fn parse(token: &str) -> Result<Self, RpcError> {
        let invalid = || RpcError::InvalidNextToken(token.to_string());
        let (index, id) = match token.split_once('.') {
            Some((_, "")) => return Err(invalid()),
            Some((index, id)) => (index, Some(id.to_string())),
            None => (token, None),
        };
        let index = index.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self { index, id })
    }

    /// Orders `item` against the cursor in listing order. A bare index
    /// comes before every id at that index.
    fn cmp_item<T: Paged>(&self, item: &T, reverse: bool) -> Ordering {
        let order = item.modify_index().cmp(&self.index).then_with(|| match &self.id {
            Some(id) => item.cursor_id().cmp(id.as_str()),
            None if reverse => Ordering::Less,
            None => Ordering::Greater,
        });
        if reverse {
            order.reverse()
        } else {
            order
        }
    }
}

pub struct Paginator<'a, T> {
    per_page: usize,
    start: Option<Cursor>,
    reverse: bool,
    filter: Option<Filter<'a, T>>,
}

impl<'a, T: Paged> Paginator<'a, T> {
    /// Reads page size, cursor and direction from `opts`.
    pub fn new(opts: &QueryOptions) -> Result<Self, RpcError> {
        let start = match opts.next_token.as_str() {
            "" => None,
            token => Some(Cursor::parse(token)?),
        };
        Ok(Self {
            per_page: opts.per_page as usize,
            start,
            reverse: opts.reverse,
            filter: None,
        })
    }

    /// Keeps only items for which `filter` returns true. Filtered items do
    /// not count toward the page size.
    pub fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + 'a) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Returns one page of `items` and the cursor of the next page, empty
    /// when nothing remains.
    pub fn page(&self, items: impl IntoIterator<Item = T>) -> (Vec<T>, String) {
        let mut items: Vec<T> = items.into_iter().collect();
        items.sort_by(|a, b| {
            let order = a
                .modify_index()
                .cmp(&b.modify_index())
                .then_with(|| a.cursor_id().cmp(b.cursor_id()));
            if self.reverse {
                order.reverse()
            } else {
                order
            }
        });

        let mut page: Vec<T> = Vec::new();
        let mut next_token = String::new();
        for item in items {
            let before_cursor = self
                .start
                .as_ref()
                .is_some_and(|start| start.cmp_item(&item, self.reverse) == Ordering::Less);
            if before_cursor {
                continue;
            }
            if self.filter.as_ref().is_some_and(|keep| !keep(&item)) {
                continue;
            }
            if self.per_page > 0 && page.len() == self.per_page {
                let index = item.modify_index();
                next_token = match page.last() {
                    Some(last) if last.modify_index() == index => {
                        format!("{index}.{}", item.cursor_id())
                    }
                    _ => index.to_string(),
                };
                break;
            }
            page.push(item);
        }
        (page, next_token)
    }
}

impl<T: Paged> Paged for std::sync::Arc<T> {
    fn modify_index(&self) -> u64 {
        T::modify_index(self)
    }

    fn cursor_id(&self) -> &str {
        T::cursor_id(self)
    }
}

impl Paged for fleet_structs::Allocation {
    fn modify_index(&self) -> u64 {
        self.modify_index
    }

    fn cursor_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Paged for fleet_structs::Deployment {
    fn modify_index(&self) -> u64 {
        self.modify_index
    }

    fn cursor_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Paged for fleet_structs::Job {
    fn modify_index(&self) -> u64 {
        self.modify_index
    }

    fn cursor_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Paged for fleet_structs::Node {
    fn modify_index(&self) -> u64 {
        self.modify_index
    }

    fn cursor_id(&self) -> &str {
        self.id.as_str()
    }
}
