//! Front end configuration templates
//!
//! Compiled once at startup into a [`Templates`] held by the deploy context.

use minijinja::{context, Environment, UndefinedBehavior};

use canopy_common::{Error, Result};

const AUDIT_POLICY: &str = "audit-policy.yaml";
const ENCRYPTION_CONFIG: &str = "encryption-config.yaml";

/// Users whose requests are never audited
const QUIET_USERS: [&str; 3] = [
    "system:kube-proxy",
    "system:apiserver",
    "system:kube-scheduler",
];

/// Compiled template environment
pub struct Templates {
    env: Environment<'static>,
}

fn template_error(name: &str, err: minijinja::Error) -> Error {
    Error::internal_with_context(format!("template {name}"), err.to_string())
}

impl Templates {
    /// Compile the bundled templates
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template(AUDIT_POLICY, include_str!("../templates/audit-policy.yaml.j2"))
            .map_err(|e| template_error(AUDIT_POLICY, e))?;
        env.add_template(
            ENCRYPTION_CONFIG,
            include_str!("../templates/encryption-config.yaml.j2"),
        )
        .map_err(|e| template_error(ENCRYPTION_CONFIG, e))?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        self.env
            .get_template(name)
            .and_then(|t| t.render(ctx))
            .map_err(|e| template_error(name, e))
    }

    /// Audit policy for the front end
    pub fn audit_policy(&self, instance: &str, level: &str) -> Result<String> {
        self.render(
            AUDIT_POLICY,
            context! {
                instance => instance,
                level => level,
                quiet_users => QUIET_USERS,
            },
        )
    }

    /// Encryption-at-rest configuration with one AES-CBC key
    pub fn encryption_config(&self, key_name: &str, key: &str) -> Result<String> {
        self.render(
            ENCRYPTION_CONFIG,
            context! {
                key_name => key_name,
                key => key,
            },
        )
    }
}
