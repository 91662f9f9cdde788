//! Scraped record shapes.

use serde::{Deserialize, Serialize};

use crate::scraper::ScrapeKind;

/// Structured fields extracted from a profile page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub full_name: Option<String>,
    pub headline: Option<String>,
    pub location: Option<String>,
    pub about: Option<String>,
    pub current_company: Option<String>,
    #[serde(default)]
    pub experience: Vec<serde_json::Value>,
    #[serde(default)]
    pub education: Vec<serde_json::Value>,
    #[serde(default)]
    pub skills: Vec<String>,
}

/// Structured fields extracted from a company page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub name: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub headquarters: Option<String>,
    pub website: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub specialties: Vec<String>,
}

/// One scraped record, discriminated by page kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScrapeRecord {
    Profile(ProfileRecord),
    Company(CompanyRecord),
}

impl ScrapeRecord {
    pub fn kind(&self) -> ScrapeKind {
        match self {
            ScrapeRecord::Profile(_) => ScrapeKind::Profile,
            ScrapeRecord::Company(_) => ScrapeKind::Company,
        }
    }

    /// Whether the record carries the minimum content worth keeping.
    pub fn is_content_valid(&self) -> bool {
        let name = match self {
            ScrapeRecord::Profile(p) => p.full_name.as_deref(),
            ScrapeRecord::Company(c) => c.name.as_deref(),
        };
        name.is_some_and(|n| !n.trim().is_empty())
    }

    /// Display name of the record, if any.
    pub fn title(&self) -> Option<&str> {
        match self {
            ScrapeRecord::Profile(p) => p.full_name.as_deref(),
            ScrapeRecord::Company(c) => c.name.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_json_shape() {
        let record = ScrapeRecord::Company(CompanyRecord {
            name: Some("Acme".to_string()),
            company_size: Some("51-200".to_string()),
            ..Default::default()
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "company");
        assert_eq!(json["companySize"], "51-200");

        let back: ScrapeRecord =
            serde_json::from_str(r#"{"type":"profile","fullName":"Ada"}"#).unwrap();
        assert_eq!(back.kind(), ScrapeKind::Profile);
        assert_eq!(back.title(), Some("Ada"));
    }

    #[test]
    fn test_content_validity_needs_a_name() {
        assert!(!ScrapeRecord::Profile(ProfileRecord::default()).is_content_valid());
        let blank = ScrapeRecord::Profile(ProfileRecord {
            full_name: Some("   ".to_string()),
            ..Default::default()
        });
        assert!(!blank.is_content_valid());
        let named = ScrapeRecord::Company(CompanyRecord {
            name: Some("Acme".to_string()),
            ..Default::default()
        });
        assert!(named.is_content_valid());
    }
}
