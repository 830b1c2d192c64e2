//! Remote table identifiers.
//!
//! Ordinals are dense and stable within one protocol version; they index the
//! per-table slots of the row cache and travel on the wire as varints.

use std::fmt;

use crate::error::MasterError;

macro_rules! table_ids {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Names one remote table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum TableId {
            $($variant,)+
        }

        impl TableId {
            /// Every table, in ordinal order.
            pub const ALL: &'static [TableId] = &[$(TableId::$variant,)+];

            /// Number of tables.
            pub const COUNT: usize = Self::ALL.len();

            /// Lower-case table name as the master knows it.
            pub fn name(self) -> &'static str {
                match self {
                    $(TableId::$variant => $name,)+
                }
            }
        }
    };
}

table_ids! {
    AoServers => "ao_servers",
    Businesses => "businesses",
    BusinessAdministrators => "business_administrators",
    BusinessServers => "business_servers",
    CreditCards => "credit_cards",
    CyrusImapdBinds => "cyrus_imapd_binds",
    DisableLog => "disable_log",
    DnsRecords => "dns_records",
    DnsZones => "dns_zones",
    EmailAddresses => "email_addresses",
    EmailDomains => "email_domains",
    EmailForwarding => "email_forwarding",
    EmailLists => "email_lists",
    EmailPipes => "email_pipes",
    HttpdServers => "httpd_servers",
    HttpdSites => "httpd_sites",
    HttpdSiteBinds => "httpd_site_binds",
    IpAddresses => "ip_addresses",
    LinuxAccounts => "linux_accounts",
    LinuxGroups => "linux_groups",
    LinuxServerAccounts => "linux_server_accounts",
    LinuxServerGroups => "linux_server_groups",
    MonthlyCharges => "monthly_charges",
    MysqlDatabases => "mysql_databases",
    MysqlServers => "mysql_servers",
    MysqlUsers => "mysql_users",
    NetBinds => "net_binds",
    NetDevices => "net_devices",
    PackageDefinitions => "package_definitions",
    Packages => "packages",
    PostgresDatabases => "postgres_databases",
    PostgresServers => "postgres_servers",
    PostgresUsers => "postgres_users",
    Servers => "servers",
    SignupRequests => "signup_requests",
    TicketActions => "ticket_actions",
    Tickets => "tickets",
    Transactions => "transactions",
    Usernames => "usernames",
}

impl TableId {
    /// Dense ordinal, usable as a slice index.
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Look up a table by ordinal.
    pub fn from_ordinal(ordinal: usize) -> Option<Self> {
        Self::ALL.get(ordinal).copied()
    }

    /// Look up a table by ordinal read from the wire.
    pub fn from_wire(ordinal: u64) -> Result<Self, MasterError> {
        usize::try_from(ordinal)
            .ok()
            .and_then(Self::from_ordinal)
            .ok_or_else(|| MasterError::decode(format!("unknown table ordinal {ordinal}")))
    }

    /// Look up a table by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_are_dense() {
        for (index, table) in TableId::ALL.iter().enumerate() {
            assert_eq!(table.ordinal(), index);
            assert_eq!(TableId::from_ordinal(index), Some(*table));
        }
        assert_eq!(TableId::from_ordinal(TableId::COUNT), None);
    }

    #[test]
    fn test_from_wire_rejects_unknown_ordinal() {
        assert!(TableId::from_wire(TableId::COUNT as u64).is_err());
        assert_eq!(TableId::from_wire(TableId::Packages.ordinal() as u64).unwrap(), TableId::Packages);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(TableId::from_name("dns_zones"), Some(TableId::DnsZones));
        assert_eq!(TableId::from_name("nope"), None);
    }
}
