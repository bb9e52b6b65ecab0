//! Nomad template stanzas that render secret store fields as environment variables.

use crate::api::types::Template;
use nomad_config::{ChangeMode, SecretDefinition};

/// Directory, relative to the task directory, that rendered secret files land in.
pub const SECRETS_DIR: &str = "secrets";

/// Render the template body for one secret definition.
///
/// Produces one `export VAR="..."` line per field mapping, wrapped in a
/// `with secret` block. The trailing newline after `{{- end }}` is part of the
/// format Nomad expects and must not be trimmed.
pub fn secret_template(secret: &SecretDefinition) -> String {
    let mut template = format!("{{{{- with secret \"{}\" -}}}}\n", secret.path);
    for (field, env_var) in &secret.fields {
        template.push_str(&format!(
            "export {}=\"{{{{ .Data.data.{} }}}}\"\n",
            env_var, field
        ));
    }
    template.push_str("{{- end }}\n");
    template
}

/// Destination of the `index`th secret stanza.
pub fn destination_path(index: usize) -> String {
    format!("{}/vault-{}.env", SECRETS_DIR, index)
}

/// One stanza per secret definition, in input order.
///
/// `change_signal` is attached only when `change_mode` is [`ChangeMode::Signal`].
pub fn secret_templates(
    secrets: &[SecretDefinition],
    change_mode: ChangeMode,
    change_signal: &str,
) -> Vec<Template> {
    let change_signal =
        (change_mode == ChangeMode::Signal).then(|| change_signal.to_string());

    secrets
        .iter()
        .enumerate()
        .map(|(index, secret)| Template {
            dest_path: destination_path(index),
            embedded_tmpl: secret_template(secret),
            envvars: true,
            change_mode: change_mode.as_str().to_string(),
            change_signal: change_signal.clone(),
        })
        .collect()
}
