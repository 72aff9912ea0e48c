use rocket::{routes, Route};

pub mod carves;
pub mod hosts;
pub mod osquery;

/// Agent-facing routes (enroll, check-in, inventory, carving)
pub fn osquery_routes() -> Vec<Route> {
    routes![
        osquery::enroll,
        osquery::checkin,
        osquery::software,
        osquery::carve_begin,
        osquery::carve_block,
    ]
}

/// Operator routes over hosts and carves
pub fn api_routes() -> Vec<Route> {
    routes![
        // Hosts
        hosts::list_hosts,
        hosts::search_hosts,
        hosts::host_summary,
        hosts::host_by_identifier,
        hosts::get_host,
        hosts::delete_host,
        hosts::refetch_host,
        hosts::transfer_hosts,
        hosts::transfer_hosts_by_filter,

        // Carves
        carves::list_carves,
        carves::get_carve,
        carves::get_block,
    ]
}
