//! Sekret session controller.
//!
//! One `SecretSession` owns the three-level selection hierarchy
//! (context → namespace → name), the edited secret and its last-confirmed
//! cluster baseline, the backup history, and the per-operation loading
//! flags. Every navigation that would discard unsaved edits goes through
//! the confirmation gate first; preference writes happen only after the
//! dependent fetch has succeeded.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use sekret_core::{backup_name, parse_backups, Backup, EditableSecret, Mapping, BACKUP_FIELD};
use sekret_kubehub::ClusterClient;
use sekret_persist::PrefStore;

pub const PREF_LAST_CONTEXT: &str = "last-selected-context";
pub const PREF_LAST_NAMESPACE: &str = "last-selected-namespace";
pub const PREF_LAST_NAME: &str = "last-selected-name";

/// Asks the user whether unsaved edits may be abandoned.
#[async_trait]
pub trait ConfirmationPrompter: Send + Sync {
    async fn should_changes_be_discarded(&self) -> bool;
}

/// Fire-and-forget user-facing signals. No return value is consumed.
pub trait NotificationSink: Send + Sync {
    fn backup_success(&self);
    fn save_failed(&self);
    fn service_restart_success(&self);
    fn service_restart_failed(&self);
}

/// Independent flags per long-running operation. Unrelated operations stay
/// enabled while another is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingFlags {
    pub secret_load: bool,
    pub secret_save: bool,
    pub service_restart: bool,
}

pub struct SecretSession {
    client: Arc<dyn ClusterClient>,
    prompter: Arc<dyn ConfirmationPrompter>,
    notifier: Arc<dyn NotificationSink>,
    prefs: Arc<dyn PrefStore>,

    context: String,
    context_list: Vec<String>,
    namespace: String,
    namespace_list: Vec<String>,
    name: String,
    name_list: Vec<String>,

    secret: EditableSecret,
    original: Mapping,
    secret_loaded: bool,

    backups: Vec<Backup>,
    selected_backup_time: Option<String>,

    loading: LoadingFlags,
}

impl SecretSession {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        prompter: Arc<dyn ConfirmationPrompter>,
        notifier: Arc<dyn NotificationSink>,
        prefs: Arc<dyn PrefStore>,
    ) -> Self {
        Self {
            client,
            prompter,
            notifier,
            prefs,
            context: String::new(),
            context_list: Vec::new(),
            namespace: String::new(),
            namespace_list: Vec::new(),
            name: String::new(),
            name_list: Vec::new(),
            secret: EditableSecret::default(),
            original: Mapping::new(),
            secret_loaded: false,
            backups: Vec::new(),
            selected_backup_time: None,
            loading: LoadingFlags::default(),
        }
    }

    // ---- startup ----

    /// Fetch contexts, adopt the persisted one when it still exists (falling
    /// back to the cluster's active context), fetch namespaces, then restore
    /// as much of the last namespace/name selection as is still valid.
    pub async fn initialize(&mut self) -> Result<()> {
        self.context_list = self.client.list_contexts().await?;
        match self.prefs.get(PREF_LAST_CONTEXT)? {
            Some(stored) if self.context_list.iter().any(|c| c == &stored) => {
                self.context = stored;
                self.client.set_context(&self.context).await?;
            }
            _ => {
                self.context = self.client.get_context().await?;
            }
        }
        self.namespace_list = self.client.list_namespaces().await?;
        self.select_last_used_namespace_and_name().await?;
        info!(context = %self.context, namespaces = self.namespace_list.len(), "session initialized");
        Ok(())
    }

    /// Restore namespace and name from the preference store. Each level is
    /// adopted only when present in the freshly fetched list; a missing
    /// link stops the restoration at that level. Restoration sets fields
    /// directly: no guard, no preference writes.
    pub async fn select_last_used_namespace_and_name(&mut self) -> Result<()> {
        let Some(namespace) = self.prefs.get(PREF_LAST_NAMESPACE)? else {
            return Ok(());
        };
        if !self.namespace_list.iter().any(|n| n == &namespace) {
            debug!(namespace = %namespace, "stored namespace no longer exists; not restored");
            return Ok(());
        }
        self.namespace = namespace;
        self.name_list = self.client.list_secrets(&self.namespace).await?;
        if let Some(name) = self.prefs.get(PREF_LAST_NAME)? {
            if self.name_list.iter().any(|n| n == &name) {
                self.name = name;
                if let Err(e) = self.load_secret().await {
                    warn!(error = %e, name = %self.name, "restored secret failed to load");
                }
            }
        }
        Ok(())
    }

    // ---- guarded selection ----

    pub async fn select_context(&mut self, context: &str) -> Result<()> {
        if !self.changes_may_be_discarded().await {
            return Ok(());
        }
        self.context = context.to_string();
        self.namespace.clear();
        self.name.clear();
        self.name_list.clear();
        self.clear_secret_state();
        self.client.set_context(context).await?;
        match self.client.list_namespaces().await {
            Ok(list) => {
                self.namespace_list = list;
                self.prefs.set(PREF_LAST_CONTEXT, context)?;
                info!(context = %context, "context selected");
            }
            Err(e) => {
                warn!(error = %e, context = %context, "namespace list failed; selection not persisted");
            }
        }
        Ok(())
    }

    pub async fn select_namespace(&mut self, namespace: &str) -> Result<()> {
        if !self.changes_may_be_discarded().await {
            return Ok(());
        }
        self.namespace = namespace.to_string();
        self.name.clear();
        self.name_list.clear();
        self.clear_secret_state();
        match self.client.list_secrets(namespace).await {
            Ok(list) => {
                self.name_list = list;
                self.prefs.set(PREF_LAST_NAMESPACE, namespace)?;
                info!(namespace = %namespace, secrets = self.name_list.len(), "namespace selected");
            }
            Err(e) => {
                warn!(error = %e, namespace = %namespace, "secret list failed; selection not persisted");
            }
        }
        Ok(())
    }

    pub async fn select_name(&mut self, name: &str) -> Result<()> {
        if !self.changes_may_be_discarded().await {
            return Ok(());
        }
        // Clear before the load starts so a slow fetch never shows the
        // previous secret under the new name.
        self.clear_secret_state();
        self.name = name.to_string();
        match self.load_secret().await {
            Ok(()) => {
                self.prefs.set(PREF_LAST_NAME, name)?;
                info!(name = %name, "secret selected");
            }
            Err(e) => {
                warn!(error = %e, name = %name, "secret load failed; selection not persisted");
            }
        }
        Ok(())
    }

    // ---- loading ----

    /// Fetch the selected secret and its backup history concurrently. The
    /// untransformed mapping becomes the dirty-comparison baseline; the
    /// loading flag is cleared on every path.
    pub async fn load_secret(&mut self) -> Result<()> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Ok(());
        }
        self.loading.secret_load = true;
        let sibling = backup_name(&self.name);
        let (primary, backup) = tokio::join!(
            self.client.load_secret(&self.namespace, &self.name),
            self.client.load_secret(&self.namespace, &sibling),
        );
        self.apply_backup_result(backup);
        let res = match primary {
            Ok(mapping) => {
                self.secret = EditableSecret::from_mapping(&mapping);
                self.original = mapping;
                self.secret_loaded = true;
                info!(ns = %self.namespace, name = %self.name, "secret loaded");
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.loading.secret_load = false;
        res
    }

    /// Refresh the backup history alone. Absence of the backup secret or a
    /// malformed payload degrades to an empty history; never an error.
    pub async fn load_backups(&mut self) {
        let sibling = backup_name(&self.name);
        let result = self.client.load_secret(&self.namespace, &sibling).await;
        self.apply_backup_result(result);
    }

    fn apply_backup_result(&mut self, result: Result<Mapping>) {
        self.backups = match result {
            Ok(mapping) => mapping
                .get(BACKUP_FIELD)
                .map(|payload| parse_backups(payload))
                .unwrap_or_default(),
            Err(e) => {
                debug!(error = %e, "no backup history");
                Vec::new()
            }
        };
        // Caller-supplied newest-first order; no re-sort.
        self.selected_backup_time = self.backups.first().map(|b| b.backup_time.clone());
    }

    /// Replace the edited pairs wholesale with a backup. The notification is
    /// paired 1:1 with the request at the moment of intent, before the
    /// confirmation gate resolves. The baseline stays untouched, so the
    /// restored state is dirty relative to the cluster.
    pub async fn load_selected_backup(&mut self, backup: &Backup) {
        self.notifier.backup_success();
        if !self.changes_may_be_discarded().await {
            return;
        }
        self.secret = EditableSecret::from_mapping(&backup.data);
        self.selected_backup_time = Some(backup.backup_time.clone());
        info!(backup_time = %backup.backup_time, "backup restored into editor");
    }

    /// Guarded re-fetch of the current selection.
    pub async fn reload_secret(&mut self) -> Result<()> {
        if !self.changes_may_be_discarded().await {
            return Ok(());
        }
        self.load_secret().await
    }

    // ---- save / restart ----

    /// Persist the edited pairs. Success adopts the saved mapping as the new
    /// baseline and re-fetches secret plus rotated backups; failure leaves
    /// baseline and edits untouched so the user can retry.
    pub async fn save_secret(&mut self) -> Result<()> {
        if !self.save_enabled() {
            debug!("save ignored; not enabled");
            return Ok(());
        }
        self.loading.secret_save = true;
        let mapping = self.secret.to_mapping();
        let res = self
            .client
            .save_secret(&self.namespace, &self.name, mapping.clone())
            .await;
        self.loading.secret_save = false;
        match res {
            Ok(()) => {
                self.original = mapping;
                info!(ns = %self.namespace, name = %self.name, "secret saved");
                if let Err(e) = self.load_secret().await {
                    warn!(error = %e, "refresh after save failed");
                }
            }
            Err(e) => {
                self.notifier.save_failed();
                warn!(error = %e, ns = %self.namespace, name = %self.name, "secret save failed; edits kept");
            }
        }
        Ok(())
    }

    /// Rolling restart of the workloads consuming the secret. Independent of
    /// save; its flag is cleared on every path.
    pub async fn restart_service(&mut self) {
        self.loading.service_restart = true;
        let res = self
            .client
            .patch_deployments(&self.namespace, &self.name)
            .await;
        self.loading.service_restart = false;
        match res {
            Ok(()) => {
                self.notifier.service_restart_success();
                info!(ns = %self.namespace, name = %self.name, "service restart requested");
            }
            Err(e) => {
                self.notifier.service_restart_failed();
                warn!(error = %e, ns = %self.namespace, name = %self.name, "service restart failed");
            }
        }
    }

    // ---- state ----

    pub fn is_dirty(&self) -> bool {
        sekret_core::is_dirty(&self.secret, &self.original)
    }

    pub fn save_enabled(&self) -> bool {
        self.secret_loaded && !self.loading.secret_save && self.is_dirty()
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn context_list(&self) -> &[String] {
        &self.context_list
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn namespace_list(&self) -> &[String] {
        &self.namespace_list
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_list(&self) -> &[String] {
        &self.name_list
    }

    pub fn secret(&self) -> &EditableSecret {
        &self.secret
    }

    /// Mutable access for the editor surface; dirtiness is re-evaluated
    /// against the baseline on demand.
    pub fn secret_mut(&mut self) -> &mut EditableSecret {
        &mut self.secret
    }

    pub fn original(&self) -> &Mapping {
        &self.original
    }

    pub fn secret_loaded(&self) -> bool {
        self.secret_loaded
    }

    pub fn backups(&self) -> &[Backup] {
        &self.backups
    }

    pub fn selected_backup_time(&self) -> Option<&str> {
        self.selected_backup_time.as_deref()
    }

    pub fn loading(&self) -> LoadingFlags {
        self.loading
    }

    // ---- internals ----

    async fn changes_may_be_discarded(&self) -> bool {
        if !self.is_dirty() {
            return true;
        }
        let discard = self.prompter.should_changes_be_discarded().await;
        if !discard {
            info!("change cancelled; unsaved edits kept");
        }
        discard
    }

    fn clear_secret_state(&mut self) {
        self.secret = EditableSecret::default();
        self.original = Mapping::new();
        self.secret_loaded = false;
        self.backups.clear();
        self.selected_backup_time = None;
    }
}
