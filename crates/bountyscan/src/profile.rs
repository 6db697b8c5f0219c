//! User profiles and the identity-completion form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::ProfileStore;
use crate::store::StoreError;

/// Credits granted to every new account.
pub const STARTING_CREDITS: u32 = 10;
pub const DEFAULT_PLAN: &str = "basic";

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    static ref PHONE_RE: Regex =
        Regex::new(r"^[+]?[(]?[0-9]{1,4}[)]?[-\s.]?[(]?[0-9]{1,4}[)]?[-\s.]?[0-9]{1,9}$").unwrap();
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid email address")]
    InvalidEmail,
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Pending,
    Active,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            other => Err(format!("unknown account status '{other}'")),
        }
    }
}

/// Contact details collected by the identity form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFields {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub organization: String,
    pub role: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub status: AccountStatus,
    pub plan: String,
    pub credits: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: Uuid,
    pub profile: ProfileFields,
    pub account: AccountInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Empty profile for a freshly enrolled face.
    pub fn pending(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            profile: ProfileFields::default(),
            account: AccountInfo {
                status: AccountStatus::Pending,
                plan: DEFAULT_PLAN.to_string(),
                credits: STARTING_CREDITS,
                created_at: now,
                completed_at: None,
            },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self, policy: CompletenessPolicy) -> bool {
        policy.is_complete(&self.profile)
    }

    /// Completion shown on the profile card. Email verification is tracked
    /// by the sign-in provider, so the caller supplies it.
    pub fn completion(&self, email_verified: bool) -> u8 {
        completion_percentage(&self.profile, email_verified)
    }
}

/// Partial update. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub organization: Option<String>,
    pub role: Option<String>,
    pub location: Option<String>,
    pub status: Option<AccountStatus>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProfileUpdate {
    /// Overwrite every contact field with the submitted form values.
    pub fn from_fields(fields: &ProfileFields) -> Self {
        Self {
            full_name: Some(fields.full_name.clone()),
            email: Some(fields.email.clone()),
            phone: Some(fields.phone.clone()),
            organization: Some(fields.organization.clone()),
            role: Some(fields.role.clone()),
            location: Some(fields.location.clone()),
            ..Self::default()
        }
    }

    pub fn apply(&self, profile: &mut UserProfile, now: DateTime<Utc>) {
        let fields = &mut profile.profile;
        let pairs = [
            (&mut fields.full_name, &self.full_name),
            (&mut fields.email, &self.email),
            (&mut fields.phone, &self.phone),
            (&mut fields.organization, &self.organization),
            (&mut fields.role, &self.role),
            (&mut fields.location, &self.location),
        ];
        for (slot, value) in pairs {
            if let Some(value) = value {
                slot.clone_from(value);
            }
        }
        if let Some(status) = self.status {
            profile.account.status = status;
        }
        if let Some(completed_at) = self.completed_at {
            profile.account.completed_at = Some(completed_at);
        }
        profile.updated_at = now;
    }
}

/// Which fields make a profile "complete".
///
/// Two predicates exist in the product: the identity form's check and the
/// dashboard's stricter one. A single policy is configured per deployment and
/// used at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletenessPolicy {
    /// fullName, email and organization non-blank.
    Basic,
    /// Basic, plus role or phone non-blank.
    #[default]
    Extended,
}

impl CompletenessPolicy {
    pub fn is_complete(&self, fields: &ProfileFields) -> bool {
        let basic = !is_blank(&fields.full_name)
            && !is_blank(&fields.email)
            && !is_blank(&fields.organization);
        match self {
            Self::Basic => basic,
            Self::Extended => basic && (!is_blank(&fields.role) || !is_blank(&fields.phone)),
        }
    }
}

impl FromStr for CompletenessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "extended" => Ok(Self::Extended),
            other => Err(format!("unknown completeness policy '{other}'")),
        }
    }
}

impl fmt::Display for CompletenessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Basic => "basic",
            Self::Extended => "extended",
        })
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

pub fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

pub fn validate_phone(phone: &str) -> bool {
    PHONE_RE.is_match(phone)
}

/// Input steps of the identity form. Step 1 (sign-in method) has no fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormStep {
    Personal,
    Professional,
}

impl FormStep {
    pub fn validate(&self, fields: &ProfileFields) -> Result<(), ProfileError> {
        match self {
            Self::Personal => {
                if is_blank(&fields.full_name) {
                    return Err(ProfileError::MissingField("fullName"));
                }
                if is_blank(&fields.email) {
                    return Err(ProfileError::MissingField("email"));
                }
                if !validate_email(&fields.email) {
                    return Err(ProfileError::InvalidEmail);
                }
            }
            Self::Professional => {
                if is_blank(&fields.phone) {
                    return Err(ProfileError::MissingField("phone"));
                }
                if is_blank(&fields.organization) {
                    return Err(ProfileError::MissingField("organization"));
                }
                if !validate_phone(&fields.phone) {
                    return Err(ProfileError::InvalidPhone);
                }
            }
        }
        Ok(())
    }
}

/// Weighted form completion, 0..=100.
pub fn completion_percentage(fields: &ProfileFields, email_verified: bool) -> u8 {
    let mut total = 0u32;
    if !is_blank(&fields.full_name) {
        total += 15;
    }
    if validate_email(&fields.email) {
        total += 20;
    }
    if validate_phone(&fields.phone) {
        total += 15;
    }
    if !is_blank(&fields.organization) {
        total += 15;
    }
    if !is_blank(&fields.role) {
        total += 10;
    }
    if !is_blank(&fields.location) {
        total += 10;
    }
    if email_verified {
        total += 15;
    }
    total.min(100) as u8
}

/// Parse a user id from a query string or CLI argument. Only UUID v4 is
/// accepted; anything else is treated as absent.
pub fn parse_user_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim())
        .ok()
        .filter(|id| id.get_version_num() == 4)
}

/// Submit the identity form for `user_id`.
///
/// Updates the existing profile, or creates one when the face was enrolled
/// but its profile write never landed. Either way the account becomes active.
pub async fn complete_profile(
    profiles: &dyn ProfileStore,
    user_id: Uuid,
    fields: ProfileFields,
) -> Result<UserProfile, ProfileError> {
    FormStep::Personal.validate(&fields)?;
    FormStep::Professional.validate(&fields)?;

    let fields = ProfileFields {
        email: fields.email.trim().to_string(),
        ..fields
    };
    let now = Utc::now();
    let update = ProfileUpdate {
        status: Some(AccountStatus::Active),
        completed_at: Some(now),
        ..ProfileUpdate::from_fields(&fields)
    };

    if profiles.get(user_id).await?.is_some() {
        profiles.update(user_id, &update).await?;
        tracing::info!(%user_id, "profile updated");
    } else {
        let mut profile = UserProfile::pending(user_id);
        update.apply(&mut profile, now);
        profiles.create(&profile).await?;
        tracing::info!(%user_id, "profile created from identity form");
    }

    profiles
        .get(user_id)
        .await?
        .ok_or_else(|| ProfileError::Store(StoreError::NotFound(user_id)))
}
