diesel::table! {
    /// Key bindings: which target a fingerprint routes to
    ssh_key (id) {
        /// unique id
        id -> Integer,
        /// SHA256 fingerprint of the client public key
        fingerprint -> Text,
        /// username the client presents (recorded, not enforced)
        username -> Text,
        /// hostname or ip address of the routing target
        target_host -> Text,
        /// ssh port on the routing target
        target_port -> Integer,
        /// login on the routing target
        target_user -> Text,
        /// disabled bindings are invisible to lookup
        enabled -> Bool,
    }
}

diesel::table! {
    /// Append-only audit log of connection decisions
    connection_log (id) {
        /// unique id
        id -> Integer,
        /// fingerprint the client presented
        fingerprint -> Text,
        /// source address of the client
        source_ip -> Text,
        /// target host, empty when routing never produced one
        target_host -> Text,
        /// target login, empty when routing never produced one
        target_user -> Text,
        /// username the client presented
        username -> Text,
        /// success, denied or error
        status -> Text,
        /// unix timestamp of the decision
        timestamp -> BigInt,
        /// denial reason or error detail
        error_message -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(ssh_key, connection_log,);
