use super::container::container_endpoint;
use super::{base_spec, stamp_generation, ObjectBackend, ReplacementPolicy};
use crate::naming::CanonicalName;
use async_trait::async_trait;
use hubspawner_common::{
    Endpoint, EngineClient, EngineObservation, MountSpec, ObjectKind, ObjectSpec, PullPolicy,
    Result, SpawnRequest, SpawnerConfig, SpawnerError,
};
use std::ffi::CString;
use std::sync::Arc;
use tracing::debug;

/// Containers that run as the matching host account with its home directory mounted.
pub struct SystemUserBackend {
    engine: Arc<dyn EngineClient>,
    config: Arc<SpawnerConfig>,
}

impl SystemUserBackend {
    pub fn new(engine: Arc<dyn EngineClient>, config: Arc<SpawnerConfig>) -> Self {
        Self { engine, config }
    }

    /// uid/gid from the configured map, else from the host passwd database.
    pub fn resolve_ids(&self, username: &str) -> Result<(u32, u32)> {
        let settings = &self.config.system_user;
        let (uid, primary_gid) = match settings.user_ids.get(username) {
            Some(uid) => (*uid, *uid),
            None => lookup_passwd(username).ok_or_else(|| {
                SpawnerError::Config(format!(
                    "user '{username}' has no configured uid and no host account"
                ))
            })?,
        };
        Ok((uid, settings.group_id.unwrap_or(primary_gid)))
    }
}

/// `getpwnam_r` lookup returning `(uid, gid)`.
pub fn lookup_passwd(username: &str) -> Option<(u32, u32)> {
    let c_name = CString::new(username).ok()?;
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some((pwd.pw_uid, pwd.pw_gid))
}

fn home_path(template: &str, username: &str) -> String {
    template.replace("{username}", username)
}

#[async_trait]
impl ObjectBackend for SystemUserBackend {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Container
    }

    fn engine(&self) -> &dyn EngineClient {
        self.engine.as_ref()
    }

    fn policy(&self) -> ReplacementPolicy {
        ReplacementPolicy::from_config(&self.config)
    }

    fn pull_policy(&self) -> PullPolicy {
        self.config.pull_policy
    }

    fn build_spec(&self, request: &SpawnRequest, name: &CanonicalName) -> Result<ObjectSpec> {
        let username = request.user_id.as_str();
        let (uid, gid) = self.resolve_ids(username)?;
        let settings = &self.config.system_user;
        let host_home = home_path(&settings.host_homedir_format_string, username);
        let image_home = home_path(&settings.image_homedir_format_string, username);
        debug!(user = %username, uid, gid, %host_home, "Resolved host account");

        let mut spec = base_spec(ObjectKind::Container, request, name, &self.config);
        spec.mounts.push(MountSpec::new(host_home, image_home.clone(), false));
        spec.env.insert("NB_USER".to_string(), username.to_string());
        spec.env.insert("USER".to_string(), username.to_string());
        spec.env.insert("NB_UID".to_string(), uid.to_string());
        spec.env.insert("NB_GID".to_string(), gid.to_string());
        spec.env.insert("HOME".to_string(), image_home.clone());
        // the image entrypoint starts as root and drops to NB_UID
        spec.user = Some("0".to_string());
        spec.working_dir = Some(image_home);
        spec.extra_host_config = self.config.extra_host_config.clone();
        stamp_generation(&mut spec);
        // record the mapped account rather than the root entrypoint user
        spec.labels
            .insert(super::LABEL_GEN_USER.to_string(), format!("{uid}:{gid}"));
        Ok(spec)
    }

    fn endpoint(&self, observed: &EngineObservation) -> Option<Endpoint> {
        container_endpoint(&self.config, observed)
    }
}
