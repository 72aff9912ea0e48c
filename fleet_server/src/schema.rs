diesel::table! {
    hosts (id) {
        id -> Integer,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        osquery_host_id -> Text,     // assigned by the agent at first enroll, never reused
        node_key -> Text,            // rotated on every enroll
        detail_updated_at -> Timestamp,
        label_updated_at -> Timestamp,
        last_enrolled_at -> Timestamp,
        seen_time -> Timestamp,
        refetch_requested -> Bool,

        hostname -> Text,
        uuid -> Text,
        platform -> Text,
        osquery_version -> Text,
        os_version -> Text,
        build -> Text,
        platform_like -> Text,
        code_name -> Text,
        uptime -> BigInt,            // seconds
        memory -> BigInt,

        cpu_type -> Text,
        cpu_brand -> Text,
        cpu_physical_cores -> Integer,
        cpu_logical_cores -> Integer,

        hardware_vendor -> Text,
        hardware_model -> Text,
        hardware_serial -> Text,
        computer_name -> Text,
        primary_ip -> Text,
        primary_mac -> Text,

        distributed_interval -> Integer, // seconds
        config_tls_refresh -> Integer,   // seconds
        logger_tls_period -> Integer,    // seconds
        team_id -> Nullable<Integer>,
    }
}

diesel::table! {
    host_additional (host_id) {
        host_id -> Integer,
        additional -> Nullable<Text>, // raw JSON from the additional queries
    }
}

diesel::table! {
    software (id) {
        id -> Integer,
        host_id -> Integer,
        name -> Text,
        version -> Text,
        source -> Text,              // chrome_extensions | deb_packages | apps | ...
    }
}

diesel::table! {
    label_membership (label_id, host_id) {
        label_id -> Integer,
        host_id -> Integer,
    }
}

diesel::table! {
    carve_metadata (id) {
        id -> Integer,
        host_id -> Integer,
        created_at -> Timestamp,
        name -> Text,
        block_count -> BigInt,
        block_size -> BigInt,
        carve_size -> BigInt,
        carve_id -> Text,
        request_id -> Text,
        session_id -> Text,
        max_block -> BigInt,         // highest block index seen, -1 when none
        expired -> Bool,
    }
}

diesel::table! {
    carve_blocks (metadata_id, block_id) {
        metadata_id -> Integer,
        block_id -> BigInt,
        data -> Binary,
    }
}

diesel::joinable!(host_additional -> hosts (host_id));
diesel::joinable!(software -> hosts (host_id));
diesel::joinable!(label_membership -> hosts (host_id));
diesel::joinable!(carve_blocks -> carve_metadata (metadata_id));

diesel::allow_tables_to_appear_in_same_query!(
    hosts,
    host_additional,
    software,
    label_membership,
    carve_metadata,
    carve_blocks,
);
