//! Tenant identifier derivation

use crate::errors::ProvisionError;

/// Postgres truncates identifiers beyond this many bytes
const MAX_IDENTIFIER_BYTES: usize = 63;

const DATABASE_PREFIX: &str = "tenant_";

/// Slugs that would collide with routes or system databases
const RESERVED_SLUGS: &[&str] = &[
    "admin",
    "api",
    "app",
    "main",
    "registry",
    "www",
    "postgres",
    "template0",
    "template1",
];

/// Slug and physical database name derived from a company name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantNames {
    pub slug: String,
    pub database_name: String,
}

impl TenantNames {
    /// Derive the slug and database name for `company_name`.
    ///
    /// The slug is the lowercased name with every run of characters outside
    /// `[a-z0-9]` replaced by one `-`. The database name is `tenant_` plus the
    /// slug with `-` turned into `_`.
    pub fn derive(company_name: &str) -> Result<Self, ProvisionError> {
        let slug = slugify(company_name);

        if !slug.bytes().any(|b| b.is_ascii_alphanumeric()) {
            return Err(invalid("must contain at least one letter or digit"));
        }
        if RESERVED_SLUGS.contains(&slug.as_str()) {
            return Err(invalid("name is reserved"));
        }

        let database_name = format!("{}{}", DATABASE_PREFIX, slug.replace('-', "_"));
        if database_name.len() > MAX_IDENTIFIER_BYTES {
            return Err(invalid("name is too long"));
        }

        Ok(Self { slug, database_name })
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut in_separator = false;

    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
            in_separator = false;
        } else if !in_separator {
            slug.push('-');
            in_separator = true;
        }
    }

    slug
}

fn invalid(reason: &str) -> ProvisionError {
    ProvisionError::InvalidName {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_punctuation_keeps_separator() {
        let names = TenantNames::derive("Acme Corp!").unwrap();
        assert_eq!(names.slug, "acme-corp-");
        assert_eq!(names.database_name, "tenant_acme_corp_");
    }

    #[test]
    fn test_runs_of_separators_collapse() {
        assert_eq!(TenantNames::derive("Acme   Corp!!").unwrap(), TenantNames::derive("Acme Corp!").unwrap());
    }

    #[test]
    fn test_digits_and_case() {
        let names = TenantNames::derive("Route66 Tools").unwrap();
        assert_eq!(names.slug, "route66-tools");
        assert_eq!(names.database_name, "tenant_route66_tools");
    }

    #[test]
    fn test_non_ascii_letters_become_separators() {
        assert_eq!(TenantNames::derive("Café Olé").unwrap().slug, "caf-ol-");
    }

    #[test]
    fn test_rejects_names_without_alphanumerics() {
        for name in ["", "   ", "!!!", "ÉÉ"] {
            assert!(
                matches!(TenantNames::derive(name), Err(ProvisionError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_reserved_slugs() {
        assert!(matches!(TenantNames::derive("Admin"), Err(ProvisionError::InvalidName { .. })));
        assert!(matches!(TenantNames::derive("postgres"), Err(ProvisionError::InvalidName { .. })));
        assert!(TenantNames::derive("Admin Tools").is_ok());
    }

    #[test]
    fn test_rejects_overlong_database_names() {
        let fits = "a".repeat(MAX_IDENTIFIER_BYTES - DATABASE_PREFIX.len());
        assert!(TenantNames::derive(&fits).is_ok());

        let too_long = format!("{}b", fits);
        assert!(matches!(TenantNames::derive(&too_long), Err(ProvisionError::InvalidName { .. })));
    }
}
