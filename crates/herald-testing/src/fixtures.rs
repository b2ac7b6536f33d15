//! Builders for owners, contacts and campaigns.

use chrono::{DateTime, Utc};
use herald_core::{Campaign, CampaignStatus, Contact, ContactId, OwnerId};

/// Builder for test contacts.
pub struct ContactBuilder {
    owner_id: OwnerId,
    phone: Option<String>,
    tags: Vec<String>,
    opted_out: bool,
}

impl ContactBuilder {
    /// Starts a contact for `owner_id` with no tags.
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id, phone: None, tags: Vec::new(), opted_out: false }
    }

    /// Sets the phone number. Defaults to a unique fake number.
    #[must_use]
    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Adds audience tags.
    #[must_use]
    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|tag| (*tag).to_string()));
        self
    }

    /// Marks the contact as opted out.
    #[must_use]
    pub fn opted_out(mut self) -> Self {
        self.opted_out = true;
        self
    }

    /// Builds the contact.
    pub fn build(self, now: DateTime<Utc>) -> Contact {
        let id = ContactId::new();
        Contact {
            id,
            owner_id: self.owner_id,
            phone: self.phone.unwrap_or_else(|| fake_phone(id)),
            tags: self.tags,
            opted_out: self.opted_out,
            created_at: now,
        }
    }
}

/// Builder for test campaigns.
pub struct CampaignBuilder {
    owner_id: OwnerId,
    name: String,
    body: String,
    audience: Vec<String>,
    status: CampaignStatus,
}

impl CampaignBuilder {
    /// Starts a draft campaign for `owner_id` targeting every contact.
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            name: "Spring sale".to_string(),
            body: "20% off everything this weekend".to_string(),
            audience: Vec::new(),
            status: CampaignStatus::Draft,
        }
    }

    /// Sets the message body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Restricts the audience to contacts carrying any of `tags`.
    #[must_use]
    pub fn audience(mut self, tags: &[&str]) -> Self {
        self.audience = tags.iter().map(|tag| (*tag).to_string()).collect();
        self
    }

    /// Overrides the starting status.
    #[must_use]
    pub fn status(mut self, status: CampaignStatus) -> Self {
        self.status = status;
        self
    }

    /// Builds the campaign.
    pub fn build(self, now: DateTime<Utc>) -> Campaign {
        let mut campaign = Campaign::draft(self.owner_id, self.name, self.body, self.audience, now);
        campaign.status = self.status;
        campaign
    }
}

fn fake_phone(id: ContactId) -> String {
    let digits: String = id.0.as_u128().to_string().chars().rev().take(9).collect();
    format!("+1555{digits:0>9}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contacts_get_distinct_phones() {
        let owner = OwnerId::new();
        let now = Utc::now();
        let a = ContactBuilder::new(owner).build(now);
        let b = ContactBuilder::new(owner).build(now);
        assert_ne!(a.phone, b.phone);
        assert!(a.phone.starts_with("+1555"));
    }

    #[test]
    fn campaign_builder_applies_audience() {
        let campaign = CampaignBuilder::new(OwnerId::new()).audience(&["vip"]).build(Utc::now());
        assert_eq!(campaign.audience, vec!["vip".to_string()]);
        assert_eq!(campaign.status, CampaignStatus::Draft);
    }
}
