//! Shell entrypoints and the staging Dockerfile
//!
//! Each renderer is a pure function of a small options value, so every
//! variant can be compared against its exact expected text.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Directory name of a buildpack inside the builder image
pub fn buildpack_checksum(name: &str) -> String {
    hex::encode(Md5::digest(name.as_bytes()))
}

/// System buildpack with its resolved download URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub name: String,
    pub url: String,
    pub checksum: String,
}

impl BuildpackInfo {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            checksum: buildpack_checksum(name),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingScript<'a> {
    /// Mirror the build result back into the host directory at `/tmp/local`
    pub rsync: bool,
    /// Checksums of the injected buildpack zips, already sorted
    pub buildpack_checksums: &'a [String],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningScript {
    /// Copy `/local` into `/app` before launch and seed it back when empty
    pub rsync: bool,
}

/// Staging entrypoint. `$0` is the buildpack order, `$1` the skip-detect flag.
pub fn staging(options: &StagingScript<'_>) -> String {
    let mut script = String::from("set -e\n");
    for checksum in options.buildpack_checksums {
        script.push_str(&format!(
            "su root -c \"unzip -qq /tmp/{0}.zip -d /tmp/buildpacks/{0}\" && rm /tmp/{0}.zip\n",
            checksum
        ));
    }
    if !options.rsync {
        script.push_str("exec ");
    }
    script.push_str(
        "su root -p -c \"PATH=$PATH exec /lifecycle/builder -outputDroplet /droplet \
         -buildpackOrder '$0' -skipDetect=$1\"\n",
    );
    if options.rsync {
        script.push_str("rsync -a /tmp/app/ /tmp/local/\n");
    }
    script
}

const RUN_UNPACK: &str = r#"if [[ ! -z $(ls -A /app) ]]; then
  exclude='--exclude=./app'
fi
tar $exclude -C / -xzf /droplet
"#;

const RUN_LAUNCH: &str = r#"command=$1
if [[ -z $command ]]; then
  if which jq; then
    command=$(jq -r .start_command /staging_info.yml)
  else
    command=$(cat /staging_info.yml | python -c 'import json,sys;obj=json.load(sys.stdin);print obj["start_command"]')
  fi
fi
exec /lifecycle/launcher /app "$command" ''
"#;

/// Run entrypoint. `$1` is the launch command, empty for the staged default.
pub fn running(options: &RunningScript) -> String {
    let mut script = String::from("set -e\n");
    if options.rsync {
        script.push_str("rsync -a /local/ /app/\n");
    }
    script.push_str(RUN_UNPACK);
    if options.rsync {
        script.push_str("if [[ -z $(ls -A /local) ]]; then\n  rsync -a /app/ /local/\nfi\n");
    }
    script.push_str(RUN_LAUNCH);
    script
}

/// Staging image: the stack plus every system buildpack, ordered by checksum
pub fn dockerfile(stack: &str, buildpacks: &[BuildpackInfo]) -> String {
    let mut sorted: Vec<&BuildpackInfo> = buildpacks.iter().collect();
    sorted.sort_by(|a, b| a.checksum.cmp(&b.checksum));

    let mut dockerfile = format!(
        "FROM {}\nRUN mkdir -p /tmp/app /tmp/cache /tmp/output-cache /tmp/buildpacks\n",
        stack
    );
    for buildpack in sorted {
        dockerfile.push_str(&format!(
            "# {name}\n\
             RUN curl -fsSL -o /tmp/{sum}.zip '{url}' && \\\n  \
             mkdir -p /tmp/buildpacks/{sum} && \\\n  \
             unzip -qq /tmp/{sum}.zip -d /tmp/buildpacks/{sum} && \\\n  \
             rm /tmp/{sum}.zip\n",
            name = buildpack.name,
            sum = buildpack.checksum,
            url = buildpack.url,
        ));
    }
    dockerfile
}
