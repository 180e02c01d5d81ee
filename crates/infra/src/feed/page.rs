//! Wire format of the customer-review feed.
//!
//! ```json
//! {"feed": {
//!   "entry": [{"id": {"label": "…"}, "im:rating": {"label": "5"}, "updated": {"label": "…"}, …}],
//!   "link":  [{"attributes": {"rel": "next", "href": "…/page=2/…/xml"}}]
//! }}
//! ```
//!
//! `entry` and `link` are omitted on an empty page and collapse to a bare
//! object when there is exactly one.

use appreview_core::{AppId, DomainError, Review, ReviewId, parse_feed_time, parse_rating};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Scalar wrapper used for every feed value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub label: String,
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self {
            label: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedAuthor {
    #[serde(default)]
    pub name: Label,
    #[serde(default)]
    pub uri: Label,
}

/// One review as the feed delivers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    #[serde(default)]
    pub id: Label,
    #[serde(default)]
    pub author: FeedAuthor,
    #[serde(default)]
    pub title: Label,
    #[serde(default)]
    pub content: Label,
    #[serde(default, rename = "im:rating")]
    pub rating: Label,
    #[serde(default)]
    pub updated: Label,
}

impl FeedEntry {
    pub fn updated_at(&self) -> Result<DateTime<Utc>, DomainError> {
        parse_feed_time(&self.updated.label)
    }

    /// Convert into the persisted shape.
    pub fn to_review(&self, app_id: &AppId) -> Result<Review, DomainError> {
        Ok(Review {
            id: ReviewId::new(self.id.label.as_str())?,
            app_id: app_id.clone(),
            author: self.author.name.label.clone(),
            title: self.title.label.clone(),
            content: self.content.label.clone(),
            rating: parse_rating(&self.rating.label)?,
            sent_at: self.updated_at()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttributes {
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedLink {
    #[serde(default)]
    pub attributes: LinkAttributes,
}

impl FeedLink {
    pub fn new(rel: &str, href: &str) -> Self {
        Self {
            attributes: LinkAttributes {
                rel: rel.to_string(),
                href: href.to_string(),
            },
        }
    }
}

/// One page of the feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default, rename = "entry", deserialize_with = "one_or_many")]
    pub entries: Vec<FeedEntry>,
    #[serde(default, rename = "link", deserialize_with = "one_or_many")]
    pub links: Vec<FeedLink>,
}

/// Top-level document: `{"feed": {...}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FeedDocument {
    #[serde(default)]
    pub feed: Page,
}

impl Page {
    /// A following page exists only when this page has entries and a
    /// `rel="next"` link.
    pub fn has_next(&self) -> bool {
        !self.entries.is_empty() && self.next_link().is_some()
    }

    fn next_link(&self) -> Option<&FeedLink> {
        self.links.iter().find(|l| l.attributes.rel == "next")
    }

    /// URL of the next page, pointed at the JSON rendition.
    ///
    /// The feed advertises its next-page links in XML form.
    pub fn next_url(&self) -> Option<String> {
        if !self.has_next() {
            return None;
        }
        self.next_link()
            .map(|l| l.attributes.href.replace("/xml", "/json"))
            .filter(|href| !href.is_empty())
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Page {
        serde_json::from_value::<FeedDocument>(value).unwrap().feed
    }

    #[test]
    fn decodes_full_page() {
        let page = parse(json!({
            "feed": {
                "author": {"name": {"label": "iTunes Store"}},
                "entry": [
                    {
                        "author": {"name": {"label": "jane"}, "uri": {"label": "https://example.com/jane"}},
                        "updated": {"label": "2024-03-01T10:15:30-07:00"},
                        "im:rating": {"label": "5"},
                        "im:version": {"label": "1.2.3"},
                        "id": {"label": "10001"},
                        "title": {"label": "Love it"},
                        "content": {"label": "Best app", "attributes": {"type": "text"}}
                    },
                    {
                        "updated": {"label": "2024-03-01T09:00:00-07:00"},
                        "im:rating": {"label": "2"},
                        "id": {"label": "10000"}
                    }
                ],
                "link": [
                    {"attributes": {"rel": "alternate", "type": "text/html", "href": "https://example.com"}},
                    {"attributes": {"rel": "next", "href": "https://example.com/page=2/id=1/sortby=mostrecent/xml?urlDesc=x"}}
                ]
            }
        }));

        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].author.name.label, "jane");
        assert!(page.has_next());
        assert_eq!(
            page.next_url().unwrap(),
            "https://example.com/page=2/id=1/sortby=mostrecent/json?urlDesc=x"
        );

        let review = page.entries[0].to_review(&AppId::new("1").unwrap()).unwrap();
        assert_eq!(review.id.as_str(), "10001");
        assert_eq!(review.rating, 5);
        assert_eq!(review.content, "Best app");
        assert_eq!(review.sent_at, Utc.with_ymd_and_hms(2024, 3, 1, 17, 15, 30).unwrap());
    }

    #[test]
    fn single_objects_collapse_to_one_element() {
        let page = parse(json!({
            "feed": {
                "entry": {"id": {"label": "1"}, "updated": {"label": "2024-03-01T10:15:30-07:00"}},
                "link": {"attributes": {"rel": "self", "href": "https://example.com"}}
            }
        }));
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.links.len(), 1);
        assert!(!page.has_next());
    }

    #[test]
    fn empty_page_has_no_next() {
        let page = parse(json!({
            "feed": {
                "link": [{"attributes": {"rel": "next", "href": "https://example.com/xml"}}]
            }
        }));
        assert!(page.entries.is_empty());
        assert!(!page.has_next());
        assert!(page.next_url().is_none());

        assert_eq!(parse(json!({})), Page::default());
    }

    #[test]
    fn conversion_rejects_bad_fields() {
        let app = AppId::new("1").unwrap();

        let mut bad_rating = testing::entry("1", "2024-03-01T10:15:30-07:00");
        bad_rating.rating = "five".into();
        assert!(matches!(bad_rating.to_review(&app), Err(DomainError::InvalidRating(_))));

        let bad_time = testing::entry("1", "yesterday");
        assert!(matches!(bad_time.to_review(&app), Err(DomainError::InvalidTimestamp { .. })));

        let no_id = testing::entry("", "2024-03-01T10:15:30-07:00");
        assert!(matches!(no_id.to_review(&app), Err(DomainError::InvalidId(_))));
    }
}
