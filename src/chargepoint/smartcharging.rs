//! Smart charging engine.
//!
//! Evaluates the instantaneous setpoint of each connector from the
//! installed profiles and builds composite schedules over a requested
//! window. All profile state lives behind one lock; the computations are
//! CPU-only and bounded by the number of installed profiles.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connectors::{Connector, Connectors};
use super::events::ChargePointEventsHandler;
use super::profile_db::{ChargingProfileList, ProfileDatabase};
use crate::config::OcppConfig;
use crate::messages::dispatcher::HandlerError;
use crate::messages::smartcharging::{
    ClearChargingProfileRequest, ClearChargingProfileResponse, GetCompositeScheduleRequest,
    GetCompositeScheduleResponse, SetChargingProfileRequest, SetChargingProfileResponse,
};
use crate::messages::types::{
    ChargingProfile, ChargingProfileKindType, ChargingProfilePurposeType, ChargingProfileStatus,
    ChargingRateUnitType, ChargingSchedule, ChargingSchedulePeriod, ClearChargingProfileStatus,
    GetCompositeScheduleStatus,
};

/// Instantaneous limit applicable to a connector or to the whole station.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartChargingSetpoint {
    pub value: f64,
    pub unit: ChargingRateUnitType,
    pub number_phases: u32,
    pub min_charging_rate: Option<f64>,
}

/// Slice of a composite schedule, relative to the evaluation instant.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Period {
    start: i64,
    duration: i64,
    setpoint: f64,
    unit: ChargingRateUnitType,
    nb_phases: u32,
}

const DEFAULT_NUMBER_PHASES: u32 = 3;

pub struct SmartChargingManager {
    operating_voltage: f64,
    ocpp_config: Arc<OcppConfig>,
    connectors: Arc<Connectors>,
    events: Arc<dyn ChargePointEventsHandler>,
    profile_db: Mutex<ProfileDatabase>,
}

impl SmartChargingManager {
    pub async fn new(
        operating_voltage: f64,
        ocpp_config: Arc<OcppConfig>,
        connectors: Arc<Connectors>,
        events: Arc<dyn ChargePointEventsHandler>,
        store: Arc<dyn crate::storage::PersistentStore>,
    ) -> Arc<Self> {
        let max_installed = ocpp_config.max_charging_profiles_installed() as usize;
        let profile_db = Mutex::new(ProfileDatabase::new(store, max_installed).await);
        let manager = Arc::new(Self {
            operating_voltage,
            ocpp_config,
            connectors,
            events,
            profile_db,
        });
        manager.cleanup_profiles().await;
        manager
    }

    /// Periodic expired-profile collection; owned by the role runtime.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(StdDuration::from_secs(60));
            tick.tick().await;
            loop {
                tick.tick().await;
                manager.cleanup_profiles().await;
            }
        })
    }

    // ── Setpoint evaluation ────────────────────────────────────

    /// Setpoints applicable right now: station-wide cap and connector
    /// limit. `None` for an unknown connector.
    pub async fn get_setpoint(
        &self,
        connector_id: u32,
        unit: ChargingRateUnitType,
    ) -> Option<(Option<SmartChargingSetpoint>, Option<SmartChargingSetpoint>)> {
        let connector = self.connectors.get(connector_id)?;
        let db = self.profile_db.lock().await;
        let now = Utc::now();

        let mut charge_point_setpoint = None;
        for (_, profile) in db.charge_point_max_profiles() {
            if let Some(period) = self.active_period(&connector, profile, now) {
                charge_point_setpoint = Some(self.fill_setpoint(profile, period, unit));
                break;
            }
        }

        let mut connector_setpoint =
            self.compute_setpoint(&connector, unit, db.tx_profiles(), now);
        if connector_setpoint.is_none() {
            connector_setpoint =
                self.compute_setpoint(&connector, unit, db.tx_default_profiles(), now);
        }

        // The connector setpoint can never exceed the station-wide cap.
        if let Some(cp) = &charge_point_setpoint {
            let exceeds = connector_setpoint
                .as_ref()
                .map_or(true, |c| c.value > cp.value);
            if exceeds {
                connector_setpoint = charge_point_setpoint.clone();
            }
        }

        Some((charge_point_setpoint, connector_setpoint))
    }

    fn compute_setpoint(
        &self,
        connector: &Connector,
        unit: ChargingRateUnitType,
        profiles: &ChargingProfileList,
        now: DateTime<Utc>,
    ) -> Option<SmartChargingSetpoint> {
        for (profile_connector, profile) in profiles {
            if *profile_connector == connector.id || *profile_connector == 0 {
                if let Some(period) = self.active_period(connector, profile, now) {
                    return Some(self.fill_setpoint(profile, period, unit));
                }
            }
        }
        None
    }

    fn fill_setpoint(
        &self,
        profile: &ChargingProfile,
        period: &ChargingSchedulePeriod,
        unit: ChargingRateUnitType,
    ) -> SmartChargingSetpoint {
        let number_phases = period.number_phases.unwrap_or(DEFAULT_NUMBER_PHASES);
        let mut setpoint = SmartChargingSetpoint {
            value: period.limit,
            unit,
            number_phases,
            min_charging_rate: profile.charging_schedule.min_charging_rate,
        };
        if profile.charging_schedule.charging_rate_unit != unit {
            setpoint.value = self.convert_to_unit(period.limit, unit, number_phases);
            setpoint.min_charging_rate = setpoint
                .min_charging_rate
                .map(|rate| self.convert_to_unit(rate, unit, number_phases));
        }
        setpoint
    }

    /// `P = U * I * phases`, with the configured nominal voltage.
    fn convert_to_unit(&self, value: f64, unit: ChargingRateUnitType, number_phases: u32) -> f64 {
        match unit {
            ChargingRateUnitType::A => value / (number_phases as f64 * self.operating_voltage),
            ChargingRateUnitType::W => value * number_phases as f64 * self.operating_voltage,
        }
    }

    // ── Tx profile lifecycle ───────────────────────────────────

    /// Install a TxProfile ahead of its transaction (no transaction id
    /// yet); used by RemoteStartTransaction's embedded profile.
    pub async fn install_tx_profile(&self, connector_id: u32, profile: ChargingProfile) -> bool {
        debug!(connector_id, "Install TxProfile");
        if profile.charging_profile_purpose != ChargingProfilePurposeType::TxProfile
            || profile.transaction_id.is_some()
        {
            return false;
        }
        self.profile_db
            .lock()
            .await
            .install(connector_id, profile)
            .await
    }

    /// Bind pending Tx profiles of a connector to a started transaction.
    pub async fn assign_pending_tx_profiles(&self, connector_id: u32, transaction_id: i32) {
        debug!(connector_id, transaction_id, "Assign pending TxProfiles");
        self.profile_db
            .lock()
            .await
            .assign_pending_tx_profiles(connector_id, transaction_id)
            .await;
    }

    /// Remove every Tx profile of a connector (transaction ended).
    pub async fn clear_tx_profiles(&self, connector_id: u32) {
        debug!(connector_id, "Clear TxProfiles");
        self.profile_db
            .lock()
            .await
            .clear(
                None,
                Some(connector_id),
                Some(ChargingProfilePurposeType::TxProfile),
                None,
            )
            .await;
    }

    // ── Request handlers ───────────────────────────────────────

    pub async fn handle_set_charging_profile(
        &self,
        request: SetChargingProfileRequest,
    ) -> Result<SetChargingProfileResponse, HandlerError> {
        let profile = &request.cs_charging_profiles;
        info!(
            charging_profile_id = profile.charging_profile_id,
            connector_id = request.connector_id,
            purpose = ?profile.charging_profile_purpose,
            stack_level = profile.stack_level,
            "Set charging profile requested"
        );

        let Some(connector) = self.connectors.get(request.connector_id) else {
            return Err(HandlerError::property_constraint("Invalid connector id"));
        };

        if profile.stack_level > self.ocpp_config.charge_profile_max_stack_level() {
            return Err(HandlerError::property_constraint(
                "Stack level exceeds ChargeProfileMaxStackLevel",
            ));
        }

        if profile.charging_schedule.charging_schedule_period.len()
            > self.ocpp_config.charging_schedule_max_periods() as usize
        {
            return Err(HandlerError::property_constraint(
                "Number of schedule periods exceeds ChargingScheduleMaxPeriods",
            ));
        }

        let allowed_units = self
            .ocpp_config
            .charging_schedule_allowed_charging_rate_unit();
        let unit_allowed = match profile.charging_schedule.charging_rate_unit {
            ChargingRateUnitType::A => allowed_units.contains("Current"),
            ChargingRateUnitType::W => allowed_units.contains("Power"),
        };
        if !unit_allowed {
            return Err(HandlerError::property_constraint(
                "Unsupported charging rate unit",
            ));
        }

        match profile.charging_profile_purpose {
            ChargingProfilePurposeType::ChargePointMaxProfile => {
                if request.connector_id != 0 {
                    return Err(HandlerError::property_constraint("Connector id must be 0"));
                }
            }
            ChargingProfilePurposeType::TxDefaultProfile => {}
            ChargingProfilePurposeType::TxProfile => {
                if !connector.has_transaction() {
                    return Err(HandlerError::property_constraint(
                        "No transaction in progress on the connector",
                    ));
                }
            }
        }

        if profile.charging_profile_kind == ChargingProfileKindType::Recurring
            && (profile.charging_schedule.start_schedule.is_none()
                || profile.charging_schedule.duration.is_none())
        {
            return Err(HandlerError::property_constraint(
                "Recurring profiles must have a start schedule and a duration",
            ));
        }

        let installed = self
            .profile_db
            .lock()
            .await
            .install(request.connector_id, profile.clone())
            .await;
        if !installed {
            return Err(HandlerError::property_constraint(
                "Number of charging profiles exceeds MaxChargingProfilesInstalled",
            ));
        }

        info!("Set charging profile status : Accepted");
        Ok(SetChargingProfileResponse {
            status: ChargingProfileStatus::Accepted,
        })
    }

    pub async fn handle_clear_charging_profile(
        &self,
        request: ClearChargingProfileRequest,
    ) -> ClearChargingProfileResponse {
        info!(
            id = ?request.id,
            connector_id = ?request.connector_id,
            purpose = ?request.charging_profile_purpose,
            stack_level = ?request.stack_level,
            "Clear charging profile requested"
        );

        let removed = self
            .profile_db
            .lock()
            .await
            .clear(
                request.id,
                request.connector_id,
                request.charging_profile_purpose,
                request.stack_level,
            )
            .await;

        let status = if removed {
            ClearChargingProfileStatus::Accepted
        } else {
            ClearChargingProfileStatus::Unknown
        };
        info!(?status, "Clear charging profile status");
        ClearChargingProfileResponse { status }
    }

    pub async fn handle_get_composite_schedule(
        &self,
        request: GetCompositeScheduleRequest,
    ) -> GetCompositeScheduleResponse {
        info!(
            connector_id = request.connector_id,
            duration = request.duration,
            unit = ?request.charging_rate_unit,
            "GetCompositeSchedule requested"
        );

        let rejected = GetCompositeScheduleResponse {
            status: GetCompositeScheduleStatus::Rejected,
            connector_id: None,
            schedule_start: None,
            charging_schedule: None,
        };

        let Some(connector) = self.connectors.get(request.connector_id) else {
            warn!(connector_id = request.connector_id, "Invalid connector id");
            return rejected;
        };

        let db = self.profile_db.lock().await;
        let now = Utc::now();

        // Stack the profile lists in priority order: Tx profiles only
        // while a transaction runs, then the defaults.
        let mut lists: Vec<&ChargingProfileList> = Vec::new();
        if connector.has_transaction() {
            lists.push(db.tx_profiles());
        }
        lists.push(db.tx_default_profiles());

        let mut periods: Vec<Period> = Vec::new();
        let mut merge_failed = false;
        for list in lists {
            let mut claimed_stack_level = u32::MAX;
            for (profile_connector, profile) in list {
                // A connector-0 profile applies as fallback unless a
                // connector-specific profile already claimed its level.
                if *profile_connector == request.connector_id
                    || (*profile_connector == 0 && claimed_stack_level != profile.stack_level)
                {
                    let profile_periods =
                        self.profile_periods(&connector, profile, now, request.duration);
                    periods = merge_profile_periods(&periods, &profile_periods);
                    claimed_stack_level = profile.stack_level;
                    if periods.is_empty() {
                        merge_failed = true;
                    }
                }
            }
            if merge_failed {
                break;
            }
        }
        if periods.is_empty() {
            info!("No charging profiles for the requested period");
        }

        // Station-wide cap: the ChargePointMax periods clamp the
        // accumulated schedule with a minimum rule.
        let mut cap_periods: Vec<Period> = Vec::new();
        let mut claimed_stack_level = u32::MAX;
        for (profile_connector, profile) in db.charge_point_max_profiles() {
            if *profile_connector == 0 && claimed_stack_level != profile.stack_level {
                let profile_periods =
                    self.profile_periods(&connector, profile, now, request.duration);
                cap_periods = merge_profile_periods(&cap_periods, &profile_periods);
                claimed_stack_level = profile.stack_level;
                if cap_periods.is_empty() {
                    break;
                }
            }
        }
        if !cap_periods.is_empty() && !periods.is_empty() {
            periods = self.merge_local_periods(&cap_periods, &periods);
        }

        // Merge the physical limitations of the installation.
        if let Some(mut schedule) = self
            .events
            .get_local_limitations_schedule(request.connector_id, request.duration)
            .filter(|s| !s.charging_schedule_period.is_empty())
        {
            schedule.start_schedule = Some(now);
            schedule.duration = Some(request.duration as i32);
            let local_profile = ChargingProfile {
                charging_profile_id: 0,
                transaction_id: None,
                stack_level: 0,
                charging_profile_purpose: ChargingProfilePurposeType::TxDefaultProfile,
                charging_profile_kind: ChargingProfileKindType::Absolute,
                recurrency_kind: None,
                valid_from: None,
                valid_to: None,
                charging_schedule: schedule,
            };
            let local_periods =
                self.profile_periods(&connector, &local_profile, now, request.duration);
            periods = self.merge_local_periods(&periods, &local_periods);
        } else {
            info!("No local limitations for the requested period");
        }

        if periods.is_empty() {
            info!("GetCompositeSchedule status : Rejected");
            return rejected;
        }

        let unit = request
            .charging_rate_unit
            .unwrap_or(ChargingRateUnitType::A);
        // The first period must start at offset 0.
        let offset = periods[0].start;
        let mut schedule_periods: Vec<ChargingSchedulePeriod> = Vec::new();
        let mut total_duration: i64 = 0;
        for period in &periods {
            let limit = if period.unit == unit {
                period.setpoint
            } else {
                self.convert_to_unit(period.setpoint, unit, period.nb_phases)
            };
            total_duration += period.duration;
            if let Some(last) = schedule_periods.last() {
                if last.limit == limit && last.number_phases == Some(period.nb_phases) {
                    continue;
                }
            }
            schedule_periods.push(ChargingSchedulePeriod {
                start_period: (period.start - offset) as i32,
                limit,
                number_phases: Some(period.nb_phases),
            });
        }

        info!("GetCompositeSchedule status : Accepted");
        GetCompositeScheduleResponse {
            status: GetCompositeScheduleStatus::Accepted,
            connector_id: Some(request.connector_id),
            schedule_start: Some(now),
            charging_schedule: Some(ChargingSchedule {
                duration: Some(total_duration as i32),
                start_schedule: Some(now + Duration::seconds(offset)),
                charging_rate_unit: unit,
                charging_schedule_period: schedule_periods,
                min_charging_rate: None,
            }),
        }
    }

    // ── Profile garbage collection ─────────────────────────────

    /// Drop profiles past their validity, absolute profiles whose
    /// schedule is over, and Tx profiles whose transaction is gone.
    pub async fn cleanup_profiles(&self) {
        let mut db = self.profile_db.lock().await;
        let now = Utc::now();
        let mut to_delete: Vec<i32> = Vec::new();

        for list in [
            db.charge_point_max_profiles(),
            db.tx_default_profiles(),
            db.tx_profiles(),
        ] {
            for (_, profile) in list {
                if profile.valid_to.map_or(false, |valid_to| valid_to < now) {
                    to_delete.push(profile.charging_profile_id);
                } else if profile.charging_profile_kind == ChargingProfileKindType::Absolute {
                    if let (Some(start), Some(duration)) = (
                        profile.charging_schedule.start_schedule,
                        profile.charging_schedule.duration,
                    ) {
                        if start + Duration::seconds(duration as i64) < now {
                            to_delete.push(profile.charging_profile_id);
                        }
                    }
                }
            }
        }

        for (profile_connector, profile) in db.tx_profiles() {
            if let Some(transaction_id) = profile.transaction_id {
                if let Some(connector) = self.connectors.get(*profile_connector) {
                    if connector.transaction_id != transaction_id {
                        to_delete.push(profile.charging_profile_id);
                    }
                }
            }
        }

        for profile_id in to_delete {
            debug!(profile_id, "Removing expired charging profile");
            db.clear_by_id(profile_id).await;
        }
    }

    // ── Profile evaluation ─────────────────────────────────────

    fn profile_valid_at(profile: &ChargingProfile, at: DateTime<Utc>) -> bool {
        profile.valid_from.map_or(true, |from| at >= from)
            && profile.valid_to.map_or(true, |to| at <= to)
    }

    /// An Absolute profile without a start schedule behaves as Relative.
    fn profile_kind(profile: &ChargingProfile) -> ChargingProfileKindType {
        match profile.charging_profile_kind {
            ChargingProfileKindType::Absolute
                if profile.charging_schedule.start_schedule.is_none() =>
            {
                ChargingProfileKindType::Relative
            }
            kind => kind,
        }
    }

    /// Start instant of the profile's schedule relative to `at`.
    fn profile_start_time(
        connector: &Connector,
        profile: &ChargingProfile,
        kind: ChargingProfileKindType,
        at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match kind {
            ChargingProfileKindType::Absolute => {
                profile.charging_schedule.start_schedule.unwrap_or(at)
            }
            ChargingProfileKindType::Relative => {
                if connector.has_transaction() {
                    connector.transaction_start.unwrap_or(at)
                } else {
                    at
                }
            }
            ChargingProfileKindType::Recurring => {
                let Some(start_schedule) = profile.charging_schedule.start_schedule else {
                    return at;
                };
                let start_local = start_schedule.with_timezone(&Local);
                let today_local = at.with_timezone(&Local);

                // Today at the scheduled wall-clock time.
                let candidate = today_local
                    .date_naive()
                    .and_time(start_local.time());
                let mut start = match Local.from_local_datetime(&candidate) {
                    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
                    LocalResult::None => today_local,
                };

                if profile.recurrency_kind
                    == Some(crate::messages::types::RecurrencyKindType::Weekly)
                {
                    let scheduled_wday = start_local.weekday().num_days_from_sunday() as i64;
                    let today_wday = today_local.weekday().num_days_from_sunday() as i64;
                    if scheduled_wday != today_wday {
                        // Day shift by the absolute weekday delta. This can
                        // land on a day that is not the scheduled weekday's
                        // next occurrence; it mirrors the historical
                        // behavior of this engine and is intentionally not
                        // corrected here.
                        let days = (scheduled_wday - today_wday).abs();
                        start = start + Duration::days(days);
                    }
                }
                start.with_timezone(&Utc)
            }
        }
    }

    /// Active schedule period of a valid profile at `at`, scanning from
    /// the last period backwards.
    fn active_period<'p>(
        &self,
        connector: &Connector,
        profile: &'p ChargingProfile,
        at: DateTime<Utc>,
    ) -> Option<&'p ChargingSchedulePeriod> {
        let index = self.active_period_index(connector, profile, at)?;
        profile.charging_schedule.charging_schedule_period.get(index)
    }

    fn active_period_index(
        &self,
        connector: &Connector,
        profile: &ChargingProfile,
        at: DateTime<Utc>,
    ) -> Option<usize> {
        if !Self::profile_valid_at(profile, at) {
            return None;
        }
        let kind = Self::profile_kind(profile);
        let start = Self::profile_start_time(connector, profile, kind, at);
        if start > at {
            return None;
        }
        if let Some(duration) = profile.charging_schedule.duration {
            if start + Duration::seconds(duration as i64) < at {
                return None;
            }
        }
        let periods = &profile.charging_schedule.charging_schedule_period;
        for (index, period) in periods.iter().enumerate().rev() {
            if start + Duration::seconds(period.start_period as i64) <= at {
                return Some(index);
            }
        }
        None
    }

    /// Slices of `profile` inside the window `[now, now + duration)`.
    fn profile_periods(
        &self,
        connector: &Connector,
        profile: &ChargingProfile,
        now: DateTime<Utc>,
        duration: u32,
    ) -> Vec<Period> {
        let schedule_periods = &profile.charging_schedule.charging_schedule_period;
        if schedule_periods.is_empty() {
            return Vec::new();
        }

        let ts_now = now.timestamp();
        let kind = Self::profile_kind(profile);
        let start_of_schedule = Self::profile_start_time(connector, profile, kind, now);
        let ts_start = start_of_schedule.timestamp();

        let mut ts_end = ts_now + duration as i64;
        if let Some(profile_duration) = profile.charging_schedule.duration {
            ts_end = ts_end.min(ts_start + profile_duration as i64);
        }

        // Either the profile is active right now, or it starts within the
        // requested window.
        let mut period_index = match self.active_period_index(connector, profile, now) {
            Some(index) => index,
            None => {
                if ts_start <= ts_end && Self::profile_valid_at(profile, start_of_schedule) {
                    0
                } else {
                    return Vec::new();
                }
            }
        };

        let mut periods = Vec::new();
        let delta_start = ts_start - ts_now;
        let mut current_start = delta_start.max(0);
        loop {
            let schedule_period = &schedule_periods[period_index];
            let mut period = Period {
                start: current_start,
                duration: 0,
                setpoint: schedule_period.limit,
                unit: profile.charging_schedule.charging_rate_unit,
                nb_phases: schedule_period
                    .number_phases
                    .unwrap_or(DEFAULT_NUMBER_PHASES),
            };

            period_index += 1;
            let last = if period_index == schedule_periods.len() {
                period.duration = ts_end - (ts_now + period.start);
                true
            } else {
                period.duration =
                    schedule_periods[period_index].start_period as i64 + delta_start - period.start;
                if period.start + period.duration + ts_now >= ts_end {
                    period.duration = ts_end - (period.start + ts_now);
                    true
                } else {
                    current_start = period.start + period.duration;
                    false
                }
            };

            periods.push(period);
            if last {
                break;
            }
        }
        periods
    }

    /// Merge a lower-priority period list into the accumulated one.
    /// Higher-priority periods win on overlap; lower-priority slices fill
    /// the gaps before and after. Non-contiguous coverage aborts with an
    /// empty result.
    fn merge_local_periods(&self, profile_periods: &[Period], local_periods: &[Period]) -> Vec<Period> {
        if profile_periods.is_empty() {
            return local_periods.to_vec();
        }

        let mut merged: Vec<Period> = Vec::new();
        let mut local_start: i64 = 0;
        let mut local_start_offset: i64 = 0;
        let mut carry = false;
        let mut profile_index = 0usize;
        let mut i = 0usize;

        while i < local_periods.len() {
            let local = local_periods[i];
            if carry {
                carry = false;
            } else {
                local_start = local.start;
                local_start_offset = 0;
            }
            let local_end = local_start + (local.duration - local_start_offset);

            if profile_index == profile_periods.len() {
                // Remaining local periods pass through unchanged.
                add_merged_period(
                    Period {
                        start: local_start,
                        duration: local.duration - local_start_offset,
                        ..local
                    },
                    &mut merged,
                );
                i += 1;
                continue;
            }

            let profile = profile_periods[profile_index];
            if local_end <= profile.start {
                // Entirely before the profile period.
                add_merged_period(
                    Period {
                        start: local_start,
                        duration: local.duration - local_start_offset,
                        ..local
                    },
                    &mut merged,
                );
                i += 1;
            } else if local_start >= profile.start {
                let profile_end = profile.start + profile.duration;
                if local_end <= profile_end {
                    // Fully inside the profile period.
                    let mut period = Period {
                        start: local_start,
                        duration: local.duration - local_start_offset,
                        ..local
                    };
                    self.merge_setpoint(&profile, &local, &mut period);
                    add_merged_period(period, &mut merged);
                    i += 1;
                } else {
                    // Crosses into the next profile period.
                    let mut period = Period {
                        start: local_start,
                        duration: profile_end - local_start,
                        ..local
                    };
                    self.merge_setpoint(&profile, &local, &mut period);
                    add_merged_period(period, &mut merged);

                    local_start = period.start + period.duration;
                    local_start_offset = local_start - local.start;
                    carry = true;
                    profile_index += 1;
                }
            } else {
                // Leading slice before the profile period starts.
                add_merged_period(
                    Period {
                        start: local_start,
                        duration: profile.start - local_start,
                        ..local
                    },
                    &mut merged,
                );
                local_start = profile.start;
                local_start_offset = local_start - local.start;
                carry = true;
            }
        }
        merged
    }

    /// Combined limit of an overlapping local and profile period: the
    /// smaller one wins, after unit alignment.
    fn merge_setpoint(&self, profile: &Period, local: &Period, merged: &mut Period) {
        let mut profile_setpoint = profile.setpoint;
        if profile.unit != local.unit {
            profile_setpoint = self.convert_to_unit(profile.setpoint, local.unit, profile.nb_phases);
        }
        if local.setpoint < profile_setpoint {
            merged.setpoint = local.setpoint;
            merged.unit = local.unit;
            merged.nb_phases = local.nb_phases;
        } else {
            merged.setpoint = profile.setpoint;
            merged.unit = profile.unit;
            merged.nb_phases = profile.nb_phases;
        }
    }
}

/// Merge a lower-stack profile's periods into the accumulator of
/// higher-priority periods. The accumulator wins on overlap; slices of the
/// new periods fill what is uncovered. A gap anywhere aborts the merge and
/// returns an empty list.
fn merge_profile_periods(ref_periods: &[Period], new_periods: &[Period]) -> Vec<Period> {
    if ref_periods.is_empty() {
        return new_periods.to_vec();
    }

    let mut merged: Vec<Period> = Vec::new();
    let mut error = false;
    let mut ref_index = 0usize;
    let mut i = 0usize;

    while i < new_periods.len() && !error {
        let new = new_periods[i];
        if ref_index != ref_periods.len() {
            if new.start < ref_periods[ref_index].start {
                if new.start + new.duration < ref_periods[ref_index].start {
                    // Entirely before the next reference period.
                    merged.push(new);
                } else {
                    // Prefix of the new period up to the reference start.
                    let prefix = Period {
                        start: new.start,
                        duration: ref_periods[ref_index].start - new.start,
                        ..new
                    };
                    merged.push(prefix);

                    let mut previous_end = prefix.start + prefix.duration;
                    while ref_index != ref_periods.len() {
                        let reference = ref_periods[ref_index];
                        if reference.start == previous_end {
                            merged.push(reference);
                            previous_end = reference.start + reference.duration;
                            ref_index += 1;
                        } else {
                            error = true;
                            break;
                        }
                    }

                    if !error && new.start + new.duration > previous_end {
                        // The new period extends past the reference
                        // periods; reprocess its remainder.
                        continue;
                    }
                }
            } else {
                // Append every consecutive reference period.
                let mut previous_end: Option<i64> = None;
                while ref_index != ref_periods.len() {
                    let reference = ref_periods[ref_index];
                    let consecutive = previous_end.map_or(true, |end| reference.start == end);
                    if consecutive {
                        merged.push(reference);
                        previous_end = Some(reference.start + reference.duration);
                        ref_index += 1;
                    } else {
                        error = true;
                        break;
                    }
                }
                if !error {
                    if let Some(end) = previous_end {
                        if new.start + new.duration > end {
                            continue;
                        }
                    }
                }
            }
        } else {
            let Some(&last) = merged.last() else {
                error = true;
                break;
            };
            let last_end = last.start + last.duration;
            if new.start + new.duration > last_end
                && (new.start < last.start || new.start < last_end)
            {
                // Tail of the new period after everything merged so far.
                merged.push(Period {
                    start: last_end,
                    duration: new.duration - (last_end - new.start),
                    ..new
                });
            } else if new.start == last_end {
                merged.push(new);
            } else if new.start > last_end {
                error = true;
            }
        }
        i += 1;
    }

    if error || ref_index != ref_periods.len() {
        warn!("Unable to compute the composite schedule due to non continuous profiles periods");
        return Vec::new();
    }
    merged
}

/// Append `period`, coalescing with the previous one when the limit, unit
/// and phase count match.
fn add_merged_period(period: Period, periods: &mut Vec<Period>) {
    if let Some(last) = periods.last_mut() {
        if last.setpoint == period.setpoint
            && last.unit == period.unit
            && last.nb_phases == period.nb_phases
        {
            last.duration += period.duration;
            return;
        }
    }
    periods.push(period);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chargepoint::events::DefaultEventsHandler;
    use crate::storage::InMemoryStore;

    fn period(start: i64, duration: i64, setpoint: f64) -> Period {
        Period {
            start,
            duration,
            setpoint,
            unit: ChargingRateUnitType::A,
            nb_phases: 3,
        }
    }

    async fn manager() -> (Arc<SmartChargingManager>, Arc<Connectors>) {
        let connectors = Arc::new(Connectors::new(2));
        let manager = SmartChargingManager::new(
            230.0,
            Arc::new(OcppConfig::new()),
            connectors.clone(),
            Arc::new(DefaultEventsHandler),
            Arc::new(InMemoryStore::new()),
        )
        .await;
        (manager, connectors)
    }

    fn absolute_profile(
        id: i32,
        purpose: ChargingProfilePurposeType,
        stack_level: u32,
        start: DateTime<Utc>,
        duration: i32,
        periods: &[(i32, f64)],
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level,
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKindType::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: Some(duration),
                start_schedule: Some(start),
                charging_rate_unit: ChargingRateUnitType::A,
                charging_schedule_period: periods
                    .iter()
                    .map(|(start_period, limit)| ChargingSchedulePeriod {
                        start_period: *start_period,
                        limit: *limit,
                        number_phases: None,
                    })
                    .collect(),
                min_charging_rate: None,
            },
        }
    }

    // ── merge rules ────────────────────────────────────────────

    #[test]
    fn merge_into_empty_accumulator() {
        let merged = merge_profile_periods(&[], &[period(0, 100, 16.0)]);
        assert_eq!(merged, vec![period(0, 100, 16.0)]);
    }

    #[test]
    fn lower_priority_fills_before_and_after() {
        let reference = [period(100, 100, 10.0)];
        let new = [period(0, 300, 20.0)];
        let merged = merge_profile_periods(&reference, &new);
        assert_eq!(
            merged,
            vec![period(0, 100, 20.0), period(100, 100, 10.0), period(200, 100, 20.0)]
        );
    }

    #[test]
    fn reference_wins_on_full_overlap() {
        let reference = [period(0, 100, 10.0), period(100, 100, 12.0)];
        let new = [period(0, 200, 20.0)];
        let merged = merge_profile_periods(&reference, &new);
        assert_eq!(merged, vec![period(0, 100, 10.0), period(100, 100, 12.0)]);
    }

    #[test]
    fn non_contiguous_reference_aborts() {
        let reference = [period(0, 100, 10.0), period(250, 50, 12.0)];
        let new = [period(0, 300, 20.0)];
        let merged = merge_profile_periods(&reference, &new);
        assert!(merged.is_empty());
    }

    #[test]
    fn local_merge_takes_minimum_on_overlap() {
        let (manager, _) = futures_executor(manager());
        let profiles = [period(0, 200, 16.0)];
        let locals = [period(0, 200, 10.0)];
        let merged = manager.merge_local_periods(&profiles, &locals);
        assert_eq!(merged, vec![period(0, 200, 10.0)]);

        let locals = [period(0, 200, 32.0)];
        let merged = manager.merge_local_periods(&profiles, &locals);
        assert_eq!(merged, vec![period(0, 200, 16.0)]);
    }

    #[test]
    fn local_merge_splits_across_profile_periods() {
        let (manager, _) = futures_executor(manager());
        let profiles = [period(0, 100, 16.0), period(100, 100, 20.0)];
        let locals = [period(0, 200, 18.0)];
        let merged = manager.merge_local_periods(&profiles, &locals);
        assert_eq!(merged, vec![period(0, 100, 16.0), period(100, 100, 18.0)]);
    }

    #[test]
    fn coalescing_merges_equal_neighbors() {
        let mut periods = vec![];
        add_merged_period(period(0, 100, 10.0), &mut periods);
        add_merged_period(period(100, 100, 10.0), &mut periods);
        add_merged_period(period(200, 100, 12.0), &mut periods);
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].duration, 200);
    }

    // Small helper to run the async fixture from sync tests.
    fn futures_executor<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    // ── setpoint evaluation ────────────────────────────────────

    #[tokio::test]
    async fn setpoint_prefers_tx_profile_and_clamps_to_station_cap() {
        let (manager, connectors) = manager().await;
        let now = Utc::now();
        connectors.with_mut(1, |c| {
            c.transaction_id = 5;
            c.transaction_start = Some(now);
        });

        {
            let mut db = manager.profile_db.lock().await;
            db.install(
                0,
                absolute_profile(
                    1,
                    ChargingProfilePurposeType::ChargePointMaxProfile,
                    0,
                    now - Duration::seconds(10),
                    3600,
                    &[(0, 20.0)],
                ),
            )
            .await;
            let mut tx = absolute_profile(
                2,
                ChargingProfilePurposeType::TxProfile,
                1,
                now - Duration::seconds(10),
                3600,
                &[(0, 32.0)],
            );
            tx.transaction_id = Some(5);
            db.install(1, tx).await;
        }

        let (cp, connector) = manager
            .get_setpoint(1, ChargingRateUnitType::A)
            .await
            .unwrap();
        assert_eq!(cp.as_ref().unwrap().value, 20.0);
        // 32 A requested by the Tx profile, clamped by the 20 A cap.
        assert_eq!(connector.unwrap().value, 20.0);
    }

    #[tokio::test]
    async fn setpoint_converts_units() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        {
            let mut db = manager.profile_db.lock().await;
            db.install(
                1,
                absolute_profile(
                    1,
                    ChargingProfilePurposeType::TxDefaultProfile,
                    0,
                    now - Duration::seconds(10),
                    3600,
                    &[(0, 16.0)],
                ),
            )
            .await;
        }
        let (_, connector) = manager
            .get_setpoint(1, ChargingRateUnitType::W)
            .await
            .unwrap();
        // 16 A * 3 phases * 230 V
        assert_eq!(connector.unwrap().value, 16.0 * 3.0 * 230.0);
    }

    #[tokio::test]
    async fn highest_stack_level_wins() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        {
            let mut db = manager.profile_db.lock().await;
            for (id, stack_level, limit) in [(1, 1, 10.0), (2, 4, 24.0)] {
                db.install(
                    1,
                    absolute_profile(
                        id,
                        ChargingProfilePurposeType::TxDefaultProfile,
                        stack_level,
                        now - Duration::seconds(10),
                        3600,
                        &[(0, limit)],
                    ),
                )
                .await;
            }
        }
        let (_, connector) = manager
            .get_setpoint(1, ChargingRateUnitType::A)
            .await
            .unwrap();
        assert_eq!(connector.unwrap().value, 24.0);
    }

    // ── composite schedule ─────────────────────────────────────

    async fn composite_with_cap(second_limit: f64) -> Vec<(i32, f64)> {
        let (manager, _) = manager().await;
        let now = Utc::now();
        {
            let mut db = manager.profile_db.lock().await;
            db.install(
                0,
                absolute_profile(
                    1,
                    ChargingProfilePurposeType::ChargePointMaxProfile,
                    0,
                    now,
                    3600,
                    &[(0, 32.0)],
                ),
            )
            .await;
            db.install(
                1,
                absolute_profile(
                    10,
                    ChargingProfilePurposeType::TxDefaultProfile,
                    0,
                    now,
                    3600,
                    &[(0, 16.0), (1800, second_limit)],
                ),
            )
            .await;
        }

        let response = manager
            .handle_get_composite_schedule(GetCompositeScheduleRequest {
                connector_id: 1,
                duration: 3600,
                charging_rate_unit: Some(ChargingRateUnitType::A),
            })
            .await;
        assert_eq!(response.status, GetCompositeScheduleStatus::Accepted);
        let schedule = response.charging_schedule.unwrap();
        assert_eq!(schedule.duration, Some(3600));
        schedule
            .charging_schedule_period
            .iter()
            .map(|p| (p.start_period, p.limit))
            .collect()
    }

    #[tokio::test]
    async fn composite_schedule_emits_default_profile_under_cap() {
        // 16 A and 20 A both fit under the 32 A station cap.
        let periods = composite_with_cap(20.0).await;
        assert_eq!(periods, vec![(0, 16.0), (1800, 20.0)]);
    }

    #[tokio::test]
    async fn composite_schedule_clamps_to_station_cap() {
        // The 40 A slice is clamped to the 32 A station cap.
        let periods = composite_with_cap(40.0).await;
        assert_eq!(periods, vec![(0, 16.0), (1800, 32.0)]);
    }

    #[tokio::test]
    async fn composite_schedule_rejected_without_profiles() {
        let (manager, _) = manager().await;
        let response = manager
            .handle_get_composite_schedule(GetCompositeScheduleRequest {
                connector_id: 1,
                duration: 3600,
                charging_rate_unit: None,
            })
            .await;
        assert_eq!(response.status, GetCompositeScheduleStatus::Rejected);
    }

    #[tokio::test]
    async fn composite_schedule_applies_local_limitations() {
        struct LimitedSite;
        #[async_trait::async_trait]
        impl ChargePointEventsHandler for LimitedSite {
            fn get_local_limitations_schedule(
                &self,
                _connector_id: u32,
                duration: u32,
            ) -> Option<ChargingSchedule> {
                Some(ChargingSchedule {
                    duration: Some(duration as i32),
                    start_schedule: None,
                    charging_rate_unit: ChargingRateUnitType::A,
                    charging_schedule_period: vec![ChargingSchedulePeriod {
                        start_period: 0,
                        limit: 10.0,
                        number_phases: None,
                    }],
                    min_charging_rate: None,
                })
            }
        }

        let connectors = Arc::new(Connectors::new(1));
        let manager = SmartChargingManager::new(
            230.0,
            Arc::new(OcppConfig::new()),
            connectors,
            Arc::new(LimitedSite),
            Arc::new(InMemoryStore::new()),
        )
        .await;

        let now = Utc::now();
        {
            let mut db = manager.profile_db.lock().await;
            db.install(
                1,
                absolute_profile(
                    1,
                    ChargingProfilePurposeType::TxDefaultProfile,
                    0,
                    now,
                    3600,
                    &[(0, 16.0)],
                ),
            )
            .await;
        }

        let response = manager
            .handle_get_composite_schedule(GetCompositeScheduleRequest {
                connector_id: 1,
                duration: 3600,
                charging_rate_unit: Some(ChargingRateUnitType::A),
            })
            .await;
        let schedule = response.charging_schedule.unwrap();
        assert_eq!(schedule.charging_schedule_period[0].limit, 10.0);
    }

    // ── install rules ──────────────────────────────────────────

    fn set_request(
        connector_id: u32,
        purpose: ChargingProfilePurposeType,
        stack_level: u32,
    ) -> SetChargingProfileRequest {
        SetChargingProfileRequest {
            connector_id,
            cs_charging_profiles: absolute_profile(
                99,
                purpose,
                stack_level,
                Utc::now(),
                3600,
                &[(0, 16.0)],
            ),
        }
    }

    #[tokio::test]
    async fn set_profile_rejects_excessive_stack_level() {
        let (manager, _) = manager().await;
        let max = manager.ocpp_config.charge_profile_max_stack_level();
        let err = manager
            .handle_set_charging_profile(set_request(
                0,
                ChargingProfilePurposeType::TxDefaultProfile,
                max + 1,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::RpcErrorCode::PropertyConstraintViolation);
    }

    #[tokio::test]
    async fn set_profile_rejects_charge_point_max_on_nonzero_connector() {
        let (manager, _) = manager().await;
        let err = manager
            .handle_set_charging_profile(set_request(
                1,
                ChargingProfilePurposeType::ChargePointMaxProfile,
                0,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::RpcErrorCode::PropertyConstraintViolation);
    }

    #[tokio::test]
    async fn set_profile_rejects_tx_profile_without_transaction() {
        let (manager, _) = manager().await;
        let err = manager
            .handle_set_charging_profile(set_request(1, ChargingProfilePurposeType::TxProfile, 0))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::RpcErrorCode::PropertyConstraintViolation);
    }

    #[tokio::test]
    async fn set_profile_rejects_recurring_without_start_and_duration() {
        let (manager, _) = manager().await;
        let mut request = set_request(1, ChargingProfilePurposeType::TxDefaultProfile, 0);
        request.cs_charging_profiles.charging_profile_kind = ChargingProfileKindType::Recurring;
        request.cs_charging_profiles.charging_schedule.duration = None;
        let err = manager
            .handle_set_charging_profile(request)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::RpcErrorCode::PropertyConstraintViolation);
    }

    #[tokio::test]
    async fn set_profile_accepts_valid_default_profile() {
        let (manager, _) = manager().await;
        let response = manager
            .handle_set_charging_profile(set_request(
                1,
                ChargingProfilePurposeType::TxDefaultProfile,
                2,
            ))
            .await
            .unwrap();
        assert_eq!(response.status, ChargingProfileStatus::Accepted);
    }

    // ── GC ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_removes_expired_and_orphaned_profiles() {
        let (manager, connectors) = manager().await;
        let now = Utc::now();
        {
            let mut db = manager.profile_db.lock().await;
            // Absolute profile whose schedule ended an hour ago.
            db.install(
                1,
                absolute_profile(
                    1,
                    ChargingProfilePurposeType::TxDefaultProfile,
                    0,
                    now - Duration::seconds(7200),
                    3600,
                    &[(0, 16.0)],
                ),
            )
            .await;
            // Tx profile bound to a transaction that no longer runs.
            let mut tx = absolute_profile(
                2,
                ChargingProfilePurposeType::TxProfile,
                1,
                now,
                3600,
                &[(0, 16.0)],
            );
            tx.transaction_id = Some(42);
            db.install(1, tx).await;
            // Still-valid profile.
            db.install(
                2,
                absolute_profile(
                    3,
                    ChargingProfilePurposeType::TxDefaultProfile,
                    1,
                    now,
                    3600,
                    &[(0, 16.0)],
                ),
            )
            .await;
        }
        connectors.with_mut(1, |c| c.transaction_id = 0);

        manager.cleanup_profiles().await;

        let db = manager.profile_db.lock().await;
        assert_eq!(db.count(), 1);
        assert_eq!(db.tx_default_profiles()[0].1.charging_profile_id, 3);
    }

    // ── recurrence ─────────────────────────────────────────────

    #[tokio::test]
    async fn relative_profile_starts_at_transaction_start() {
        let (manager, connectors) = manager().await;
        let now = Utc::now();
        connectors.with_mut(1, |c| {
            c.transaction_id = 9;
            c.transaction_start = Some(now - Duration::seconds(1800));
        });
        let connector = connectors.get(1).unwrap();

        let mut profile = absolute_profile(
            1,
            ChargingProfilePurposeType::TxProfile,
            0,
            now,
            3600,
            &[(0, 16.0), (1200, 20.0)],
        );
        // No start schedule: Absolute degrades to Relative.
        profile.charging_schedule.start_schedule = None;

        let index = manager
            .active_period_index(&connector, &profile, now)
            .unwrap();
        // 1800 s into the schedule, so the 1200 s period is active.
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn daily_recurring_profile_uses_todays_time_of_day() {
        let (manager, connectors) = manager().await;
        let connector = connectors.get(1).unwrap();
        let now = Utc::now();

        let mut profile = absolute_profile(
            1,
            ChargingProfilePurposeType::TxDefaultProfile,
            0,
            now - Duration::days(10),
            86400,
            &[(0, 16.0)],
        );
        profile.charging_profile_kind = ChargingProfileKindType::Recurring;
        profile.recurrency_kind = Some(crate::messages::types::RecurrencyKindType::Daily);

        // The schedule started 10 days ago at this time of day and lasts a
        // full day, so it is active right now.
        assert!(manager
            .active_period_index(&connector, &profile, now)
            .is_some());
    }
}
