use std::time::SystemTime;

use cloudsync_core::protocol::{
    AskJoinParameters, AskPasswordExchangeKeyParameters, CloudSessionResult,
    CreateSessionParameters, FinalizeJoinParameters, FinalizeJoinSessionResult,
    FinalizeJoinSessionStatus, GivePasswordExchangeKeyParameters,
    InformPasswordIsWrongParameters, JoinSessionResult, JoinSessionStatus, PathItemParameters,
    SessionMemberInfo, SetAuthCheckedParameters, UpdateSessionSettingsParameters,
    ValidateJoinParameters,
};
use cloudsync_core::{
    session_id, Client, CloudSession, GroupName, PathItem, PushEvent, SessionMember,
    SessionPathItems, SharedFile, Synchronization, TrackingAction,
};
use cloudsync_storage::{Entities, Transaction};

use crate::presence::{ClientPresence, PushTarget};
use crate::synchronization::SynchronizationEngine;
use crate::EngineError;

const MAX_SESSION_ID_ATTEMPTS: usize = 16;

/// Common guard of every handshake step.
fn joinable(session: &CloudSession) -> Result<(), JoinSessionStatus> {
    if session.is_removed {
        Err(JoinSessionStatus::SessionNotFound)
    } else if session.is_activated {
        Err(JoinSessionStatus::SessionAlreadyActivated)
    } else {
        Ok(())
    }
}

/// Handshake correlation a joiner presents to finalize.
#[derive(Debug, Clone)]
struct FinalizeRequest {
    joiner: String,
    validator: String,
    password: String,
    private_data: Vec<u8>,
}

impl FinalizeRequest {
    fn status(&self, session: &CloudSession) -> FinalizeJoinSessionStatus {
        if session.is_removed {
            return FinalizeJoinSessionStatus::SessionNotFound;
        }
        if session.is_activated {
            return FinalizeJoinSessionStatus::SessionAlreadyActivated;
        }
        let Some(pre_member) = session.pre_member(&self.joiner).filter(|pre_member| {
            pre_member.validator_instance_id.as_deref() == Some(self.validator.as_str())
                && pre_member.finalization_password.as_deref() == Some(self.password.as_str())
        }) else {
            return FinalizeJoinSessionStatus::PrememberNotFound;
        };
        if !session.is_auth_checked(pre_member) {
            return FinalizeJoinSessionStatus::AuthIsNotChecked;
        }
        FinalizeJoinSessionStatus::Success
    }

    fn promote(&self, session: &mut CloudSession) -> bool {
        if self.status(session) != FinalizeJoinSessionStatus::Success {
            return false;
        }
        let Some(index) = session
            .pre_members
            .iter()
            .position(|pre_member| pre_member.client_instance_id == self.joiner)
        else {
            return false;
        };
        let mut member = session.pre_members.remove(index);
        member.encrypted_private_data = Some(self.private_data.clone());
        member.finalization_password = None;
        member.auth_checked_by.clear();
        member.joined_on = SystemTime::now();
        session.members.push(member);
        true
    }
}

/// Lifecycle of cloud sessions: creation, the join handshake, quitting,
/// settings, reset and member path items.
#[derive(Clone)]
pub struct SessionRegistry {
    entities: Entities,
    presence: ClientPresence,
    synchronizations: SynchronizationEngine,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(
        entities: Entities,
        presence: ClientPresence,
        synchronizations: SynchronizationEngine,
    ) -> Self {
        Self {
            entities,
            presence,
            synchronizations,
        }
    }

    async fn load(&self, session_id: &str) -> Result<Option<CloudSession>, EngineError> {
        Ok(self
            .entities
            .get::<CloudSession>(session_id)
            .await?
            .filter(|session| !session.is_removed))
    }

    /// Current view of a session. Removed sessions read as not found.
    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CloudSessionResult>, EngineError> {
        Ok(self.load(session_id).await?.as_ref().map(CloudSessionResult::from))
    }

    /// Members of a session, visible to its members only.
    pub async fn get_members(
        &self,
        client: &Client,
        session_id: &str,
    ) -> Result<Option<Vec<SessionMemberInfo>>, EngineError> {
        Ok(self
            .load(session_id)
            .await?
            .filter(|session| session.is_member(&client.client_instance_id))
            .map(|session| session.members.iter().map(SessionMemberInfo::from).collect()))
    }

    pub async fn create_session(
        &self,
        client: &Client,
        params: CreateSessionParameters,
    ) -> Result<CloudSessionResult, EngineError> {
        let creator_instance_id = client.client_instance_id.clone();

        for _ in 0..MAX_SESSION_ID_ATTEMPTS {
            let session_id = session_id::generate();
            let mut creator = SessionMember::new(
                &client.client_id,
                &creator_instance_id,
                params.creator_public_key.clone(),
            );
            creator.encrypted_private_data = params.creator_private_data.clone();
            let session = CloudSession::new(&session_id, params.settings.clone(), creator);

            let mut tx = Transaction::new();
            let candidate = session.clone();
            let staged = self
                .entities
                .stage_add_or_update(&mut tx, &session_id, move |current: Option<CloudSession>| {
                    current.is_none().then(|| candidate.clone())
                })
                .await?;
            if !staged.is_accepted() {
                continue;
            }
            let group = GroupName::session(&session_id);
            self.presence
                .stage_group_subscription(&mut tx, &creator_instance_id, group.clone())
                .await?;
            if !self.entities.commit(tx).await? {
                continue;
            }

            self.presence.join_group(&creator_instance_id, &group).await;
            tracing::info!(%session_id, creator = %creator_instance_id, "session created");
            return Ok(CloudSessionResult::from(&session));
        }

        tracing::error!(creator = %creator_instance_id, "no free session id found");
        Err(EngineError::SessionIdExhausted)
    }

    /// Handshake step 1: the joiner announces itself and its exchange key.
    pub async fn ask_password_exchange_key(
        &self,
        client: &Client,
        params: AskPasswordExchangeKeyParameters,
    ) -> Result<JoinSessionResult, EngineError> {
        let joiner = client.client_instance_id.clone();
        let mut tx = Transaction::new();

        let pre_member = SessionMember::new(&client.client_id, &joiner, params.public_key.clone());
        let staged = self
            .entities
            .stage_update(&mut tx, &params.session_id, move |session: &mut CloudSession| {
                if joinable(session).is_err() || session.is_member(&pre_member.client_instance_id) {
                    return false;
                }
                session
                    .pre_members
                    .retain(|existing| existing.client_instance_id != pre_member.client_instance_id);
                session.pre_members.push(pre_member.clone());
                true
            })
            .await?;
        if !staged.is_accepted() {
            let status = match self.entities.get::<CloudSession>(&params.session_id).await? {
                None => JoinSessionStatus::SessionNotFound,
                Some(session) => match joinable(&session) {
                    Err(status) => status,
                    // Already a member: nothing to negotiate.
                    Ok(()) => JoinSessionStatus::ProcessingNormally,
                },
            };
            return Ok(JoinSessionResult::with_status(status));
        }

        let lobby = GroupName::lobby(&params.session_id);
        self.presence
            .stage_group_subscription(&mut tx, &joiner, lobby.clone())
            .await?;
        if !self.entities.commit(tx).await? {
            return Ok(JoinSessionResult::with_status(
                JoinSessionStatus::SessionAlreadyActivated,
            ));
        }
        self.presence.join_group(&joiner, &lobby).await;

        self.presence
            .push(
                PushTarget::SessionGroup(params.session_id.clone()),
                PushEvent::PasswordExchangeKeyRequested {
                    session_id: params.session_id,
                    joiner_instance_id: joiner,
                    public_key: params.public_key,
                },
            )
            .await;
        Ok(JoinSessionResult::with_status(
            JoinSessionStatus::ProcessingNormally,
        ))
    }

    /// Handshake step 2: a member answers with its own exchange key.
    pub async fn give_password_exchange_key(
        &self,
        client: &Client,
        params: GivePasswordExchangeKeyParameters,
    ) -> Result<JoinSessionResult, EngineError> {
        let validator = client.client_instance_id.clone();
        let status = match self.entities.get::<CloudSession>(&params.session_id).await? {
            None => JoinSessionStatus::SessionNotFound,
            Some(session) => match joinable(&session) {
                Err(status) => status,
                Ok(()) if !session.is_member(&validator) => JoinSessionStatus::NotAMember,
                Ok(()) if session.pre_member(&params.joiner_instance_id).is_none() => {
                    JoinSessionStatus::PrememberNotFound
                }
                Ok(()) => JoinSessionStatus::ProcessingNormally,
            },
        };
        if status != JoinSessionStatus::ProcessingNormally {
            return Ok(JoinSessionResult::with_status(status));
        }

        self.presence
            .push(
                PushTarget::Client(params.joiner_instance_id),
                PushEvent::PasswordExchangeKeyGiven {
                    session_id: params.session_id,
                    validator_instance_id: validator.clone(),
                    public_key: params.public_key,
                },
            )
            .await;
        Ok(JoinSessionResult {
            status,
            validator_instance_id: Some(validator),
        })
    }

    /// Handshake step 3: the joiner sends the encrypted password to the
    /// member it picked as validator.
    pub async fn ask_join(
        &self,
        client: &Client,
        params: AskJoinParameters,
    ) -> Result<JoinSessionResult, EngineError> {
        let joiner = client.client_instance_id.as_str();
        let validator = params.validator_instance_id.as_str();
        let mut status = JoinSessionStatus::SessionNotFound;

        let result = self
            .entities
            .update(&params.session_id, |session: &mut CloudSession| {
                if let Err(rejected) = joinable(session) {
                    status = rejected;
                    return false;
                }
                if !session.is_member(validator) {
                    status = JoinSessionStatus::NotAMember;
                    return false;
                }
                let Some(pre_member) = session.pre_member_mut(joiner) else {
                    status = JoinSessionStatus::PrememberNotFound;
                    return false;
                };
                pre_member.validator_instance_id = Some(validator.to_owned());
                pre_member.finalization_password = None;
                status = JoinSessionStatus::ProcessingNormally;
                true
            })
            .await?;
        if !result.is_saved {
            return Ok(JoinSessionResult::with_status(status));
        }

        self.presence
            .push(
                PushTarget::Client(params.validator_instance_id.clone()),
                PushEvent::JoinRequested {
                    session_id: params.session_id.clone(),
                    joiner_instance_id: joiner.to_owned(),
                    encrypted_password: params.encrypted_password,
                },
            )
            .await;
        Ok(JoinSessionResult {
            status,
            validator_instance_id: Some(params.validator_instance_id),
        })
    }

    /// Handshake step 4: the validator accepted the password and hands the
    /// joiner a finalization password.
    pub async fn validate_join(
        &self,
        client: &Client,
        params: ValidateJoinParameters,
    ) -> Result<JoinSessionResult, EngineError> {
        let validator = client.client_instance_id.as_str();
        let joiner = params.joiner_instance_id.as_str();
        let password = params.finalization_password.as_str();
        let mut status = JoinSessionStatus::SessionNotFound;

        let result = self
            .entities
            .update(&params.session_id, |session: &mut CloudSession| {
                if let Err(rejected) = joinable(session) {
                    status = rejected;
                    return false;
                }
                if !session.is_member(validator) {
                    status = JoinSessionStatus::NotAMember;
                    return false;
                }
                let Some(pre_member) = session
                    .pre_member_mut(joiner)
                    .filter(|pre_member| pre_member.validator_instance_id.as_deref() == Some(validator))
                else {
                    status = JoinSessionStatus::PrememberNotFound;
                    return false;
                };
                pre_member.finalization_password = Some(password.to_owned());
                status = JoinSessionStatus::ProcessingNormally;
                true
            })
            .await?;
        if !result.is_saved {
            return Ok(JoinSessionResult::with_status(status));
        }

        self.presence
            .push(
                PushTarget::Client(params.joiner_instance_id.clone()),
                PushEvent::JoinValidated {
                    session_id: params.session_id.clone(),
                    validator_instance_id: validator.to_owned(),
                    finalization_password: params.finalization_password.clone(),
                },
            )
            .await;
        Ok(JoinSessionResult {
            status,
            validator_instance_id: Some(validator.to_owned()),
        })
    }

    /// The validator rejects the joiner's password; the pending join is dropped.
    pub async fn inform_password_is_wrong(
        &self,
        client: &Client,
        params: InformPasswordIsWrongParameters,
    ) -> Result<JoinSessionResult, EngineError> {
        let validator = client.client_instance_id.clone();
        let joiner = params.joiner_instance_id.clone();
        let mut tx = Transaction::new();

        let (checked_validator, checked_joiner) = (validator.clone(), joiner.clone());
        let staged = self
            .entities
            .stage_update(&mut tx, &params.session_id, move |session: &mut CloudSession| {
                if !session.is_member(&checked_validator) {
                    return false;
                }
                let before = session.pre_members.len();
                session.pre_members.retain(|pre_member| {
                    pre_member.client_instance_id != checked_joiner
                        || pre_member.validator_instance_id.as_deref()
                            != Some(checked_validator.as_str())
                });
                session.pre_members.len() != before
            })
            .await?;
        if !staged.is_accepted() {
            let status = match self.entities.get::<CloudSession>(&params.session_id).await? {
                None => JoinSessionStatus::SessionNotFound,
                Some(session) if session.is_removed => JoinSessionStatus::SessionNotFound,
                Some(session) if !session.is_member(&validator) => JoinSessionStatus::NotAMember,
                Some(_) => JoinSessionStatus::PrememberNotFound,
            };
            return Ok(JoinSessionResult::with_status(status));
        }

        let lobby = GroupName::lobby(&params.session_id);
        self.presence
            .stage_group_unsubscription(&mut tx, &joiner, lobby.clone())
            .await?;
        if !self.entities.commit(tx).await? {
            return Ok(JoinSessionResult::with_status(
                JoinSessionStatus::PrememberNotFound,
            ));
        }
        self.presence.leave_group(&joiner, &lobby).await;

        tracing::info!(session_id = %params.session_id, %joiner, %validator, "join rejected: wrong password");
        self.presence
            .push(
                PushTarget::Client(joiner),
                PushEvent::WrongPassword {
                    session_id: params.session_id,
                    validator_instance_id: validator.clone(),
                },
            )
            .await;
        Ok(JoinSessionResult {
            status: JoinSessionStatus::ProcessingNormally,
            validator_instance_id: Some(validator),
        })
    }

    /// A member records that it checked the joiner's identity.
    pub async fn set_auth_checked(
        &self,
        client: &Client,
        params: SetAuthCheckedParameters,
    ) -> Result<JoinSessionResult, EngineError> {
        let checker = client.client_instance_id.as_str();
        let joiner = params.checked_instance_id.as_str();
        let mut status = JoinSessionStatus::SessionNotFound;

        self.entities
            .update(&params.session_id, |session: &mut CloudSession| {
                if let Err(rejected) = joinable(session) {
                    status = rejected;
                    return false;
                }
                if !session.is_member(checker) {
                    status = JoinSessionStatus::NotAMember;
                    return false;
                }
                let Some(pre_member) = session.pre_member_mut(joiner) else {
                    status = JoinSessionStatus::PrememberNotFound;
                    return false;
                };
                status = JoinSessionStatus::ProcessingNormally;
                pre_member.auth_checked_by.insert(checker.to_owned())
            })
            .await?;
        Ok(JoinSessionResult::with_status(status))
    }

    /// Handshake step 5: promotes the joiner once the correlation matches and
    /// every member has checked it.
    pub async fn finalize_join(
        &self,
        client: &Client,
        params: FinalizeJoinParameters,
    ) -> Result<FinalizeJoinSessionResult, EngineError> {
        let request = FinalizeRequest {
            joiner: client.client_instance_id.clone(),
            validator: params.validator_instance_id.clone(),
            password: params.finalization_password.clone(),
            private_data: params.encrypted_private_data.clone(),
        };
        let session_group = GroupName::session(&params.session_id);
        let lobby = GroupName::lobby(&params.session_id);

        for _ in 0..self.entities.max_attempts() {
            let mut tx = Transaction::new();
            let promotion = request.clone();
            let staged = self
                .entities
                .stage_update(&mut tx, &params.session_id, move |session: &mut CloudSession| {
                    promotion.promote(session)
                })
                .await?;
            if !staged.is_accepted() {
                return self.finalize_rejection(&params.session_id, &request).await;
            }
            self.presence
                .stage_group_subscription(&mut tx, &request.joiner, session_group.clone())
                .await?;
            self.presence
                .stage_group_unsubscription(&mut tx, &request.joiner, lobby.clone())
                .await?;
            if !self.entities.commit(tx).await? {
                continue;
            }

            self.presence.leave_group(&request.joiner, &lobby).await;
            self.presence.join_group(&request.joiner, &session_group).await;

            let session = self.load(&params.session_id).await?;
            let member = session
                .as_ref()
                .and_then(|session| session.member(&request.joiner))
                .map(SessionMemberInfo::from);
            if let Some(member) = member {
                self.presence
                    .push(
                        PushTarget::SessionGroup(params.session_id.clone()),
                        PushEvent::MemberJoinedSession {
                            session_id: params.session_id.clone(),
                            member,
                        },
                    )
                    .await;
            }
            tracing::info!(session_id = %params.session_id, joiner = %request.joiner, "member joined session");
            return Ok(FinalizeJoinSessionResult {
                status: FinalizeJoinSessionStatus::Success,
                session: session.as_ref().map(CloudSessionResult::from),
            });
        }

        self.finalize_rejection(&params.session_id, &request).await
    }

    async fn finalize_rejection(
        &self,
        session_id: &str,
        request: &FinalizeRequest,
    ) -> Result<FinalizeJoinSessionResult, EngineError> {
        let status = match self.entities.get::<CloudSession>(session_id).await? {
            None => FinalizeJoinSessionStatus::SessionNotFound,
            Some(session) => match request.status(&session) {
                // Lost a race that the next read no longer shows.
                FinalizeJoinSessionStatus::Success => FinalizeJoinSessionStatus::PrememberNotFound,
                status => status,
            },
        };
        tracing::debug!(session_id, joiner = %request.joiner, ?status, "join not finalized");
        Ok(FinalizeJoinSessionResult {
            status,
            session: None,
        })
    }

    /// Removes the caller from the session. A run still open becomes fatal,
    /// the caller's path items are dropped and the remaining members told.
    pub async fn quit_session(&self, client: &Client, session_id: &str) -> Result<bool, EngineError> {
        let departing = client.client_instance_id.clone();
        let mut tx = Transaction::new();

        let leaving = departing.clone();
        let staged = self
            .entities
            .stage_update(&mut tx, session_id, move |session: &mut CloudSession| {
                if session.is_removed {
                    return false;
                }
                let was_pre_member = session.pre_member(&leaving).is_some();
                session.remove_member(&leaving) || was_pre_member
            })
            .await?;
        if !staged.is_accepted() {
            return Ok(false);
        }
        let session_group = GroupName::session(session_id);
        let lobby = GroupName::lobby(session_id);
        self.presence
            .stage_group_unsubscription(&mut tx, &departing, session_group.clone())
            .await?;
        self.presence
            .stage_group_unsubscription(&mut tx, &departing, lobby.clone())
            .await?;
        let departure = self
            .synchronizations
            .stage_fatal_member_departure(&mut tx, session_id, &departing)
            .await?;
        if !self.entities.commit(tx).await? {
            return Ok(false);
        }
        self.presence.leave_group(&departing, &session_group).await;
        self.presence.leave_group(&departing, &lobby).await;

        let removed = self
            .entities
            .get::<CloudSession>(session_id)
            .await?
            .map_or(true, |session| session.is_removed);
        tracing::info!(session_id, client_instance_id = %departing, removed, "member quit session");

        if let Some(departure) = &departure {
            self.synchronizations.publish_departure(departure).await;
        }

        let mut removed_items = Vec::new();
        self.entities
            .update(session_id, |items: &mut SessionPathItems| {
                removed_items = items.remove_owned_by(&departing);
                !removed_items.is_empty()
            })
            .await?;
        for item in removed_items {
            self.presence
                .push(
                    PushTarget::SessionGroup(session_id.to_owned()),
                    PushEvent::PathItemRemoved {
                        session_id: session_id.to_owned(),
                        item,
                    },
                )
                .await;
        }

        self.presence
            .push(
                PushTarget::SessionGroup(session_id.to_owned()),
                PushEvent::MemberQuittedSession {
                    session_id: session_id.to_owned(),
                    client_instance_id: departing,
                },
            )
            .await;
        Ok(true)
    }

    /// Replaces the encrypted settings. Frozen once a synchronization started.
    pub async fn update_session_settings(
        &self,
        client: &Client,
        params: UpdateSessionSettingsParameters,
    ) -> Result<bool, EngineError> {
        let editor = client.client_instance_id.as_str();
        let settings = &params.settings;
        let result = self
            .entities
            .update(&params.session_id, |session: &mut CloudSession| {
                if session.is_removed || session.is_activated || !session.is_member(editor) {
                    return false;
                }
                session.settings = settings.clone();
                true
            })
            .await?;
        if !result.is_saved {
            return Ok(false);
        }

        self.presence
            .push(
                PushTarget::SessionGroupExcept {
                    session_id: params.session_id.clone(),
                    excluded: editor.to_owned(),
                },
                PushEvent::SessionSettingsUpdated {
                    session_id: params.session_id.clone(),
                    settings: params.settings.clone(),
                },
            )
            .await;
        Ok(true)
    }

    /// Clears pending joins, path items and any leftover run state. Only
    /// allowed before the session is activated.
    pub async fn reset_session(&self, client: &Client, session_id: &str) -> Result<bool, EngineError> {
        let requester = client.client_instance_id.clone();
        let mut tx = Transaction::new();

        let member = requester.clone();
        let staged = self
            .entities
            .stage_update(&mut tx, session_id, move |session: &mut CloudSession| {
                if session.is_removed || session.is_activated || !session.is_member(&member) {
                    return false;
                }
                session.pre_members.clear();
                true
            })
            .await?;
        if !staged.is_accepted() {
            return Ok(false);
        }

        let lobby = GroupName::lobby(session_id);
        let session = self.entities.get::<CloudSession>(session_id).await?;
        let pending: Vec<String> = session
            .map(|session| {
                session
                    .pre_members
                    .iter()
                    .map(|pre_member| pre_member.client_instance_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for joiner in &pending {
            self.presence
                .stage_group_unsubscription(&mut tx, joiner, lobby.clone())
                .await?;
        }
        self.entities.stage_delete::<SessionPathItems>(&mut tx, session_id);
        self.entities.stage_delete::<Synchronization>(&mut tx, session_id);
        let prefix = format!("{session_id}_");
        for id in self.entities.list_ids::<TrackingAction>(&prefix).await? {
            self.entities.stage_delete::<TrackingAction>(&mut tx, &id);
        }
        for id in self.entities.list_ids::<SharedFile>(&prefix).await? {
            self.entities.stage_delete::<SharedFile>(&mut tx, &id);
        }
        if !self.entities.commit(tx).await? {
            return Ok(false);
        }

        tracing::info!(session_id, reset_by = %requester, "session reset");
        let event = PushEvent::SessionResetted {
            session_id: session_id.to_owned(),
            client_instance_id: requester,
        };
        // Joiners hear about the reset before they leave the lobby.
        self.presence
            .push(PushTarget::LobbyGroup(session_id.to_owned()), event.clone())
            .await;
        for joiner in &pending {
            self.presence.leave_group(joiner, &lobby).await;
        }
        self.presence
            .push(PushTarget::SessionGroup(session_id.to_owned()), event)
            .await;
        Ok(true)
    }

    /// Declares a data source. Rejected once the session is activated or
    /// when the caller already declared the same code.
    pub async fn add_path_item(
        &self,
        client: &Client,
        params: PathItemParameters,
    ) -> Result<bool, EngineError> {
        let item = PathItem {
            code: params.code.clone(),
            client_instance_id: client.client_instance_id.clone(),
            encrypted_data: params.encrypted_data.clone(),
        };
        let mut tx = Transaction::new();
        if !self
            .stage_path_items_guard(&mut tx, &params.session_id, &item.client_instance_id)
            .await?
        {
            return Ok(false);
        }

        let (session_id, added) = (params.session_id.clone(), item.clone());
        let staged = self
            .entities
            .stage_add_or_update(&mut tx, &params.session_id, move |current: Option<SessionPathItems>| {
                let mut items = current.unwrap_or_else(|| SessionPathItems::new(&session_id));
                if items.items.iter().any(|existing| {
                    existing.code == added.code
                        && existing.client_instance_id == added.client_instance_id
                }) {
                    return None;
                }
                items.items.push(added.clone());
                Some(items)
            })
            .await?;
        if !staged.is_accepted() || !self.entities.commit(tx).await? {
            return Ok(false);
        }

        self.presence
            .push(
                PushTarget::SessionGroup(params.session_id.clone()),
                PushEvent::PathItemAdded {
                    session_id: params.session_id,
                    item,
                },
            )
            .await;
        Ok(true)
    }

    /// Withdraws one of the caller's own path items.
    pub async fn remove_path_item(
        &self,
        client: &Client,
        params: PathItemParameters,
    ) -> Result<bool, EngineError> {
        let owner = client.client_instance_id.clone();
        let mut tx = Transaction::new();
        if !self
            .stage_path_items_guard(&mut tx, &params.session_id, &owner)
            .await?
        {
            return Ok(false);
        }

        let (code, removing) = (params.code.clone(), owner.clone());
        let staged = self
            .entities
            .stage_update(&mut tx, &params.session_id, move |items: &mut SessionPathItems| {
                let before = items.items.len();
                items
                    .items
                    .retain(|item| item.code != code || item.client_instance_id != removing);
                items.items.len() != before
            })
            .await?;
        if !staged.is_accepted() {
            return Ok(false);
        }
        let removed = self
            .entities
            .get::<SessionPathItems>(&params.session_id)
            .await?
            .and_then(|items| {
                items
                    .items
                    .into_iter()
                    .find(|item| item.code == params.code && item.client_instance_id == owner)
            });
        if !self.entities.commit(tx).await? {
            return Ok(false);
        }

        if let Some(item) = removed {
            self.presence
                .push(
                    PushTarget::SessionGroup(params.session_id.clone()),
                    PushEvent::PathItemRemoved {
                        session_id: params.session_id,
                        item,
                    },
                )
                .await;
        }
        Ok(true)
    }

    /// Path items of every member, visible to members only.
    pub async fn get_path_items(
        &self,
        client: &Client,
        session_id: &str,
    ) -> Result<Option<Vec<PathItem>>, EngineError> {
        let is_member = self
            .load(session_id)
            .await?
            .is_some_and(|session| session.is_member(&client.client_instance_id));
        if !is_member {
            return Ok(None);
        }
        Ok(Some(
            self.entities
                .get::<SessionPathItems>(session_id)
                .await?
                .map(|items| items.items)
                .unwrap_or_default(),
        ))
    }

    /// Pins the session in `tx` so a path item change only commits while the
    /// caller is a member of a session that is not activated.
    async fn stage_path_items_guard(
        &self,
        tx: &mut Transaction,
        session_id: &str,
        client_instance_id: &str,
    ) -> Result<bool, EngineError> {
        let member = client_instance_id.to_owned();
        let staged = self
            .entities
            .stage_update(tx, session_id, move |session: &mut CloudSession| {
                !session.is_removed && !session.is_activated && session.is_member(&member)
            })
            .await?;
        Ok(staged.is_accepted())
    }
}
