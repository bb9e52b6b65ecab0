// Container setup script.
//
// The workspace directory must sit at the same absolute path on the host and
// in the container: the agent later asks the host's docker daemon to bind
// mount paths under it.

/// Shared workspace directory, identical on host and in the container.
pub const SHARED_WORKSPACE_PATH: &str = "/tmp/devpod-workspaces";

/// Written once initial setup has finished; the readiness probe tests for it.
pub const READY_MARKER: &str = "/tmp/.devpod-ready";

const SECRETS_GLOB: &str = "/secrets/vault-*.env";
const COMBINED_SECRETS: &str = ".vault-secrets";

/// The task's `/bin/sh -c` payload.
///
/// Creates the shared workspace directory, installs the agent's runtime
/// dependencies, concatenates rendered secret files, then writes
/// [`READY_MARKER`]. With `sync_secrets`, a detached loop keeps copying the
/// combined secrets file into each workspace content directory as the agent
/// creates them. The script then idles so the task stays up.
pub fn setup_script(sync_secrets: bool) -> String {
    let combined = format!("{}/{}", SHARED_WORKSPACE_PATH, COMBINED_SECRETS);

    let mut steps = vec![
        format!("mkdir -p {}", SHARED_WORKSPACE_PATH),
        "apt-get update -qq".to_string(),
        "apt-get install -y -qq curl git ca-certificates".to_string(),
        "update-ca-certificates".to_string(),
        format!(
            "(for f in {}; do [ -f \"$f\" ] && cat \"$f\" >> {}; done || true)",
            SECRETS_GLOB, combined
        ),
        "sleep 2".to_string(),
        format!("touch {}", READY_MARKER),
    ];

    if sync_secrets {
        steps.push(format!(
            "(while true; do find {root}/agent/contexts/*/workspaces/*/content -maxdepth 0 -type d 2>/dev/null | \
             while read wsdir; do if [ -f {combined} ] && [ ! -f \"$wsdir/{name}\" ]; then \
             cp {combined} \"$wsdir/{name}\" && chmod 644 \"$wsdir/{name}\"; fi; done; sleep 5; done)",
            root = SHARED_WORKSPACE_PATH,
            combined = combined,
            name = COMBINED_SECRETS,
        ));
    }

    format!("{} & sleep infinity", steps.join(" && "))
}
