use super::{
    file_config::{ClusterInfo, ContextInfo, Kubeconfig, UserInfo},
    DuplicateNamePolicy, ResolvePolicy,
};
use crate::{Error, Result};

/// KubeConfigOptions stores options used when loading kubeconfig file.
#[derive(Default, Clone, Debug)]
pub struct KubeConfigOptions {
    /// The named context to load
    pub context: Option<String>,
    /// The cluster to load
    pub cluster: Option<String>,
    /// The user to load
    pub user: Option<String>,
    /// How ambiguous or incomplete documents are treated
    pub policy: ResolvePolicy,
}

/// ConfigLoader loads current context, cluster, and authentication information
/// from a kubeconfig file.
#[derive(Clone, Debug)]
pub(crate) struct ConfigLoader {
    pub(crate) current_context: ContextInfo,
    pub(crate) cluster_name: String,
    pub(crate) cluster: ClusterInfo,
    pub(crate) user_name: String,
    pub(crate) user: UserInfo,
}

impl ConfigLoader {
    pub(crate) fn load(config: &Kubeconfig, options: &KubeConfigOptions) -> Result<Self> {
        let duplicates = options.policy.duplicate_names;
        let context_name = match (&options.context, &config.current_context) {
            (Some(name), _) | (None, Some(name)) => name,
            (None, None) => return Err(Error::CurrentContextNotSet),
        };

        let current_context = find_named(&config.contexts, context_name, "context", duplicates, |c| {
            (&c.name, &c.context)
        })?
        .clone();

        let cluster_name = options.cluster.as_ref().unwrap_or(&current_context.cluster);
        let cluster = find_named(&config.clusters, cluster_name, "cluster", duplicates, |c| {
            (&c.name, &c.cluster)
        })?
        .clone();

        let user_name = options.user.as_ref().unwrap_or(&current_context.user);
        let user = find_named(&config.users, user_name, "user", duplicates, |u| (&u.name, &u.user))?.clone();

        tracing::debug!(
            context = %context_name,
            cluster = %cluster_name,
            user = %user_name,
            "selected kubeconfig context"
        );

        Ok(ConfigLoader {
            cluster_name: cluster_name.clone(),
            user_name: user_name.clone(),
            current_context,
            cluster,
            user,
        })
    }
}

/// Look up `name` among `entries` in document order.
///
/// With [`DuplicateNamePolicy::FirstMatch`] the first entry wins and later ones are ignored.
fn find_named<'a, T, V, F>(
    entries: &'a [T],
    name: &str,
    kind: &'static str,
    policy: DuplicateNamePolicy,
    f: F,
) -> Result<&'a V>
where
    F: Fn(&'a T) -> (&'a String, &'a V),
{
    let mut matches = entries.iter().map(&f).filter(|(n, _)| n.as_str() == name);
    let (_, first) = matches.next().ok_or_else(|| Error::NotFound {
        kind,
        name: name.to_owned(),
    })?;
    if policy == DuplicateNamePolicy::Reject && matches.next().is_some() {
        return Err(Error::DuplicateName {
            kind,
            name: name.to_owned(),
        });
    }
    Ok(first)
}
