// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

/// Declares a closed enum that is stored as a fixed string both in
/// json and in the metadata database.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $repr:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize,
        )]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $repr)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $repr,)+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($repr => Ok($name::$variant),)+
                    _ => Err(concat!("invalid ", stringify!($name))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    /// Role of an entity in the federation.
    pub enum Role {
        /// The single node accepting writes and driving consensus.
        Coordinator => "coordinator",
        /// Node that seals blocks and keeps a replica.
        ArchivalPeer => "archival_peer",
        Institution => "institution",
        Applicant => "applicant",
        Employer => "employer",
        Admin => "admin",
    }
}

impl Role {
    /// Roles that may issue registration codes.
    #[must_use]
    pub fn may_issue_auth_codes(&self) -> bool {
        matches!(self, Role::Admin | Role::Coordinator)
    }

    /// Roles a registration code may be issued for.
    #[must_use]
    pub fn is_registrable(&self) -> bool {
        !matches!(self, Role::Coordinator)
    }
}

string_enum! {
    pub enum ActivityState {
        Offline => "offline",
        Online => "online",
    }
}

string_enum! {
    /// Session token state.
    pub enum TokenState {
        /// Issued but not presented yet.
        Fresh => "fresh",
        /// Presented at least once.
        InUse => "in_use",
        /// Logged out or past expiry.
        Expired => "expired",
        /// Reserved, never entered.
        RetainedExpired => "retained_expired",
    }
}

impl TokenState {
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, TokenState::Fresh | TokenState::InUse)
    }
}

string_enum! {
    pub enum AssociationKind {
        Organization => "organization",
        Institution => "institution",
        Employer => "employer",
        Cohort => "cohort",
    }
}

string_enum! {
    /// Liveness of an archival peer as seen by the coordinator.
    pub enum NodeStatus {
        Available => "available",
        Mining => "mining",
        Unreachable => "unreachable",
    }
}

string_enum! {
    /// State of an employer access request.
    pub enum RequestState {
        Opened => "opened",
        Approved => "approved",
        Rejected => "rejected",
        Closed => "closed",
    }
}

string_enum! {
    /// State of a consensus negotiation round.
    pub enum NegotiationState {
        Opened => "opened",
        Delivered => "delivered",
        Sealed => "sealed",
        Finalized => "finalized",
        Failed => "failed",
    }
}

impl NegotiationState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Finalized | NegotiationState::Failed)
    }
}
